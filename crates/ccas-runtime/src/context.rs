use ccas_config::CcasConfig;
use ccas_core::{CcSessionContext, ServerCcSession};
use ccas_shared::DiameterMessage;
use tracing::{debug, info, warn};

/// Session context with a fixed default validity time, logging the
/// supervision lifecycle. Deployments with richer bookkeeping supply their
/// own `CcSessionContext` instead.
pub struct StaticSessionContext {
    default_validity_time_secs: u32,
}

impl StaticSessionContext {
    pub fn new(default_validity_time_secs: u32) -> Self {
        Self {
            default_validity_time_secs,
        }
    }

    pub fn from_config(config: &CcasConfig) -> Self {
        Self::new(config.default_validity_time_secs)
    }
}

impl CcSessionContext for StaticSessionContext {
    fn default_validity_time_secs(&self) -> u32 {
        self.default_validity_time_secs
    }

    fn on_supervision_timer_started(&self, session: &ServerCcSession) {
        debug!(session_id = %session.session_id(), "Tcc started");
    }

    fn on_supervision_timer_restarted(&self, session: &ServerCcSession) {
        debug!(session_id = %session.session_id(), "Tcc restarted");
    }

    fn on_supervision_timer_stopped(&self, session: &ServerCcSession) {
        debug!(session_id = %session.session_id(), "Tcc stopped");
    }

    fn on_supervision_timer_expired(&self, session: &ServerCcSession) {
        info!(
            session_id = %session.session_id(),
            "Tcc expired, revoking authorization"
        );
    }

    fn on_request_timed_out(&self, request: &DiameterMessage) {
        warn!(
            command_code = request.command_code,
            end_to_end_id = request.end_to_end_id,
            "outgoing request timed out"
        );
    }
}
