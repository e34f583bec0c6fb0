use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ccas_core::{ServerCcSession, TimerFacility, TimerHandle};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

/// One fired timer, delivered to the expiry driver
#[derive(Debug)]
pub struct TimerExpiry {
    pub session_id: String,
    pub timer_name: &'static str,
    pub handle: TimerHandle,
}

/// Timer facility on top of the tokio timer wheel.
///
/// Each scheduled timer is one sleeping task plus an entry in the pending
/// table. Cancellation removes the entry; a sleeper that wakes up and no
/// longer finds its entry fires nothing, so a cancelled timer can never
/// deliver an expiry. Expiries are funneled through a channel so the driver
/// can hand them to worker tasks.
pub struct TokioTimerFacility {
    next_id: AtomicU64,
    pending: Arc<DashMap<TimerHandle, ()>>,
    expiry_tx: mpsc::UnboundedSender<TimerExpiry>,
}

impl TokioTimerFacility {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerExpiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let facility = Arc::new(Self {
            next_id: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            expiry_tx,
        });
        (facility, expiry_rx)
    }

    /// Number of timers currently scheduled
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl TimerFacility for TokioTimerFacility {
    fn schedule(&self, session_id: &str, timer_name: &'static str, delay_ms: u64) -> TimerHandle {
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        // insert before spawning so a zero-delay timer cannot race its own
        // registration
        self.pending.insert(handle.clone(), ());

        let pending = self.pending.clone();
        let expiry_tx = self.expiry_tx.clone();
        let session_id = session_id.to_string();
        let fired = handle.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay_ms)).await;
            if pending.remove(&fired).is_some() {
                let _ = expiry_tx.send(TimerExpiry {
                    session_id,
                    timer_name,
                    handle: fired,
                });
            }
        });

        handle
    }

    fn cancel(&self, handle: &TimerHandle) {
        if self.pending.remove(handle).is_none() {
            debug!(handle = handle.id(), "cancel of unknown timer handle ignored");
        }
    }
}

/// Deliver expiries to their sessions on the shared worker pool.
///
/// `resolve` is supplied by the owning registry; an expiry for a session it
/// no longer knows is dropped.
pub async fn run_expiry_driver<R>(mut expiry_rx: mpsc::UnboundedReceiver<TimerExpiry>, resolve: R)
where
    R: Fn(&str) -> Option<Arc<ServerCcSession>> + Send + 'static,
{
    while let Some(expiry) = expiry_rx.recv().await {
        let Some(session) = resolve(&expiry.session_id) else {
            debug!(
                session_id = %expiry.session_id,
                "timer expiry for unknown session dropped"
            );
            continue;
        };
        tokio::spawn(async move {
            session.on_timer_expired(expiry.timer_name, &expiry.handle);
        });
    }
}
