use crate::data::TimerHandle;
use crate::error::Result;
use crate::events::{CreditControlRequest, ReAuthAnswer, ReAuthRequest};
use crate::session::ServerCcSession;
use ccas_shared::DiameterMessage;

/// Decodes raw messages into the typed wrappers the state machine consumes.
/// Wire-level parsing lives behind this contract, not in the session layer.
pub trait CcMessageFactory: Send + Sync {
    fn create_credit_control_request(&self, raw: DiameterMessage)
        -> Result<CreditControlRequest>;

    fn create_re_auth_request(&self, raw: DiameterMessage) -> Result<ReAuthRequest>;

    fn create_re_auth_answer(&self, raw: DiameterMessage) -> Result<ReAuthAnswer>;

    /// Authorized application ids. Session construction fails if empty.
    fn application_ids(&self) -> Vec<u32>;
}

/// Application callback notified of protocol-significant occurrences.
///
/// Invoked synchronously under the session lock; implementations may call
/// back into the same session from the same thread (the lock is reentrant),
/// for example to send the answer for a request just delivered.
pub trait CcSessionListener: Send + Sync {
    /// A credit-control request needs a business decision
    fn on_credit_control_request(&self, session: &ServerCcSession, request: &CreditControlRequest);

    /// A re-authorization answer arrived for an earlier RAR
    fn on_re_auth_answer(
        &self,
        session: &ServerCcSession,
        request: &ReAuthRequest,
        answer: &ReAuthAnswer,
    );

    /// A message with a command code this state machine does not handle
    fn on_other_event(
        &self,
        session: &ServerCcSession,
        request: Option<&DiameterMessage>,
        answer: Option<&DiameterMessage>,
    );
}

/// Deployment-supplied configuration and lifecycle notifications
pub trait CcSessionContext: Send + Sync {
    /// Validity time (seconds) applied when a successful answer carries none
    fn default_validity_time_secs(&self) -> u32;

    fn on_supervision_timer_started(&self, _session: &ServerCcSession) {}

    fn on_supervision_timer_restarted(&self, _session: &ServerCcSession) {}

    fn on_supervision_timer_stopped(&self, _session: &ServerCcSession) {}

    fn on_supervision_timer_expired(&self, _session: &ServerCcSession) {}

    fn on_request_timed_out(&self, _request: &DiameterMessage) {}
}

/// Timer scheduling facility consumed by the session layer.
///
/// `schedule` must return a fresh handle per call; `cancel` must guarantee the
/// expiry for that handle is never delivered afterwards. Both are synchronous
/// and are called while the session lock is held.
pub trait TimerFacility: Send + Sync {
    fn schedule(&self, session_id: &str, timer_name: &'static str, delay_ms: u64) -> TimerHandle;

    fn cancel(&self, handle: &TimerHandle);
}

/// Outbound send path toward the transport. Failures are logged and
/// swallowed by the caller, never propagated past a committed transition.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: DiameterMessage) -> Result<()>;
}
