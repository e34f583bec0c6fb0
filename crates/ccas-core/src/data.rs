use serde::{Deserialize, Serialize};

/// Credit-control server session state
///
/// `Idle` means no active authorization; `Open` means an authorization has
/// been granted and the session is under Tcc liveness supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Open,
}

/// Opaque identity of one scheduled timer instance.
///
/// Compared by value so a callback for an already-replaced timer can be told
/// apart from the currently scheduled one. `None` in the data holder means
/// "no timer", a non-matching handle means "stale".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Durable per-session record, mutated only by the state machine under the
/// session lock. Created and destroyed by the owning registry, never here.
#[derive(Debug, Clone)]
pub struct SessionData {
    state: SessionState,
    timer_handle: Option<TimerHandle>,
    stateless: bool,
    authorized_application_ids: Vec<u32>,
}

impl SessionData {
    pub fn new(stateless: bool) -> Self {
        Self {
            state: SessionState::Idle,
            timer_handle: None,
            stateless,
            authorized_application_ids: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn timer_handle(&self) -> Option<&TimerHandle> {
        self.timer_handle.as_ref()
    }

    pub(crate) fn set_timer_handle(&mut self, handle: Option<TimerHandle>) {
        self.timer_handle = handle;
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    pub fn authorized_application_ids(&self) -> &[u32] {
        &self.authorized_application_ids
    }

    pub(crate) fn set_authorized_application_ids(&mut self, ids: Vec<u32>) {
        self.authorized_application_ids = ids;
    }

    /// A scheduled timer is only legal while the session is Open.
    pub fn invariant_holds(&self) -> bool {
        self.timer_handle.is_none() || self.state == SessionState::Open
    }
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new(false)
    }
}
