use std::sync::Arc;

use ccas_core::ServerCcSession;
use ccas_shared::DiameterMessage;

/// Hands inbound messages to the worker pool so the transport thread never
/// blocks on session processing. Answer delivery on this protocol is always
/// asynchronous; none of these entry points return one.
pub struct EventDispatcher {
    session: Arc<ServerCcSession>,
}

impl EventDispatcher {
    pub fn new(session: Arc<ServerCcSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<ServerCcSession> {
        &self.session
    }

    /// Queue one inbound request for processing
    pub fn on_request_received(&self, request: DiameterMessage) {
        let session = self.session.clone();
        tokio::spawn(async move {
            session.process_request(request);
        });
    }

    /// Queue one inbound answer (for an earlier outgoing request)
    pub fn on_answer_received(&self, request: DiameterMessage, answer: DiameterMessage) {
        let session = self.session.clone();
        tokio::spawn(async move {
            session.process_answer(request, answer);
        });
    }

    /// Relay a request timeout reported by the transport
    pub fn on_request_timeout(&self, request: DiameterMessage) {
        let session = self.session.clone();
        tokio::spawn(async move {
            session.request_timed_out(&request);
        });
    }
}
