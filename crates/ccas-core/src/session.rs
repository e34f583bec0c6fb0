use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::contracts::{
    CcMessageFactory, CcSessionContext, CcSessionListener, MessageSender, TimerFacility,
};
use crate::data::{SessionData, SessionState, TimerHandle};
use crate::error::{CcasError, Result};
use crate::events::{CreditControlAnswer, Event, EventKind, ReAuthRequest};
use ccas_shared::{is_success, DiameterMessage, CMD_CREDIT_CONTROL, CMD_RE_AUTH};

/// Name under which the session supervision timer is scheduled
pub const TCC_TIMER_NAME: &str = "TCC_CCASERVER_TIMER";

/// Effect of one transition. Side effects run under the session lock; the
/// returned state (if any) is committed afterwards by `handle_event`.
type Effect = fn(&ServerCcSession, &Event) -> Result<Option<SessionState>>;

struct Transition {
    effect: Effect,
}

/// Explicit transition table keyed by (state, event kind). Pairs not listed
/// here are illegal and fail with `UnexpectedEvent`.
fn lookup(state: SessionState, kind: EventKind) -> Option<Transition> {
    use EventKind::*;
    use SessionState::*;

    let effect: Effect = match (state, kind) {
        (Idle, ReceivedInitial) | (Idle, ReceivedEvent) => {
            ServerCcSession::deliver_credit_control_request
        }
        (Idle, SentEventResponse) => ServerCcSession::sent_event_response,
        (Idle, SentInitialResponse) => ServerCcSession::sent_initial_response,
        (Open, ReceivedUpdate) | (Open, ReceivedTerminate) => {
            ServerCcSession::deliver_credit_control_request
        }
        (Open, SentUpdateResponse) => ServerCcSession::sent_update_response,
        (Open, SentTerminateResponse) => ServerCcSession::sent_terminate_response,
        (Open, ReceivedReAuthAnswer) => ServerCcSession::deliver_re_auth_answer,
        (Open, SentReAuthRequest) => ServerCcSession::sent_re_auth_request,
        _ => return None,
    };
    Some(Transition { effect })
}

/// References the session can drop on release, plus the data holder. All of
/// it lives behind the reentrant send-and-state lock.
struct SessionInner {
    data: SessionData,
    listener: Option<Arc<dyn CcSessionListener>>,
    factory: Option<Arc<dyn CcMessageFactory>>,
    sender: Option<Arc<dyn MessageSender>>,
}

/// Server-side credit-control session state machine.
///
/// All transitions, timer actions and outbound sends for one session are
/// serialized on a single reentrant lock, so a listener callback running
/// inside a transition may synchronously send the corresponding answer
/// through the same session.
pub struct ServerCcSession {
    session_id: String,
    inner: ReentrantMutex<RefCell<SessionInner>>,
    context: Arc<dyn CcSessionContext>,
    timers: Arc<dyn TimerFacility>,
}

impl ServerCcSession {
    pub fn new(
        session_id: impl Into<String>,
        mut data: SessionData,
        factory: Arc<dyn CcMessageFactory>,
        listener: Arc<dyn CcSessionListener>,
        context: Arc<dyn CcSessionContext>,
        timers: Arc<dyn TimerFacility>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self> {
        let application_ids = factory.application_ids();
        if application_ids.is_empty() {
            return Err(CcasError::InvalidWiring(
                "message factory advertises no application ids".to_string(),
            ));
        }
        data.set_authorized_application_ids(application_ids);

        Ok(Self {
            session_id: session_id.into(),
            inner: ReentrantMutex::new(RefCell::new(SessionInner {
                data,
                listener: Some(listener),
                factory: Some(factory),
                sender: Some(sender),
            })),
            context,
            timers,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        let guard = self.inner.lock();
        let state = guard.borrow().data.state();
        state
    }

    pub fn is_stateless(&self) -> bool {
        let guard = self.inner.lock();
        let stateless = guard.borrow().data.is_stateless();
        stateless
    }

    pub fn authorized_application_ids(&self) -> Vec<u32> {
        let guard = self.inner.lock();
        let ids = guard.borrow().data.authorized_application_ids().to_vec();
        ids
    }

    pub fn has_active_timer(&self) -> bool {
        let guard = self.inner.lock();
        let active = guard.borrow().data.timer_handle().is_some();
        active
    }

    /// True once `release()` has detached the application references
    pub fn is_released(&self) -> bool {
        let guard = self.inner.lock();
        let released = guard.borrow().listener.is_none();
        released
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Apply one event to the state machine.
    ///
    /// Fails with `UnexpectedEvent` for (state, event) pairs outside the
    /// transition table, leaving the session data untouched. Decode errors
    /// from answer classification propagate the same way. Outbound send
    /// failures do not: by then the transition is committed.
    pub fn handle_event(&self, event: Event) -> Result<()> {
        let _guard = self.inner.lock();
        let state = self.state();
        let kind = event.kind();

        let Some(transition) = lookup(state, kind) else {
            ccas_metrics::PROTOCOL_ERRORS_TOTAL.inc();
            warn!(
                session_id = %self.session_id,
                state = ?state,
                kind = ?kind,
                "event is not legal in current state"
            );
            return Err(CcasError::UnexpectedEvent {
                state,
                kind,
                detail: format!("session {}", self.session_id),
            });
        };

        let next = (transition.effect)(self, &event)?;
        if let Some(next) = next {
            self.set_state(next);
        }
        ccas_metrics::TRANSITIONS_TOTAL.inc();
        Ok(())
    }

    /// Feed an outgoing CCA into the state machine; the event kind is
    /// inferred from the CC-Request-Type the answer carries.
    pub fn send_credit_control_answer(&self, answer: CreditControlAnswer) -> Result<()> {
        let event = Event::from_sent_answer(answer)?;
        self.handle_event(event)
    }

    pub fn send_re_auth_request(&self, request: ReAuthRequest) -> Result<()> {
        self.handle_event(Event::SentReAuthRequest(request))
    }

    // ------------------------------------------------------------------
    // Dispatcher task bodies
    // ------------------------------------------------------------------

    /// Process one inbound request. Runs on a worker task; all errors are
    /// contained here so a malformed message never crashes the pool.
    pub fn process_request(&self, request: DiameterMessage) {
        if let Err(error) = self.try_process_request(request) {
            warn!(
                session_id = %self.session_id,
                error = %error,
                "failed to process request message"
            );
        }
    }

    fn try_process_request(&self, request: DiameterMessage) -> Result<()> {
        match request.command_code {
            CMD_CREDIT_CONTROL => {
                let factory = self.factory()?;
                let ccr = factory.create_credit_control_request(request)?;
                self.handle_event(Event::from_received_request(ccr))
            }
            _ => {
                let listener = self.listener()?;
                listener.on_other_event(self, Some(&request), None);
                Ok(())
            }
        }
    }

    /// Process one inbound answer delivered for an earlier outgoing request
    pub fn process_answer(&self, request: DiameterMessage, answer: DiameterMessage) {
        if let Err(error) = self.try_process_answer(request, answer) {
            warn!(
                session_id = %self.session_id,
                error = %error,
                "failed to process answer message"
            );
        }
    }

    fn try_process_answer(&self, request: DiameterMessage, answer: DiameterMessage) -> Result<()> {
        match request.command_code {
            CMD_RE_AUTH => {
                let factory = self.factory()?;
                let rar = factory.create_re_auth_request(request)?;
                let raa = factory.create_re_auth_answer(answer)?;
                self.handle_event(Event::ReceivedReAuthAnswer(rar, raa))
            }
            _ => {
                let listener = self.listener()?;
                listener.on_other_event(self, Some(&request), Some(&answer));
                Ok(())
            }
        }
    }

    /// An outgoing request saw no answer in time. Session state is not
    /// touched; the context decides what to do.
    pub fn request_timed_out(&self, request: &DiameterMessage) {
        self.context.on_request_timed_out(request);
    }

    // ------------------------------------------------------------------
    // Tcc supervision timer
    // ------------------------------------------------------------------

    /// Timer expiry callback. Supervisory override: verifies the fired
    /// handle still matches the stored one, then forces Idle without the
    /// full release path.
    pub fn on_timer_expired(&self, timer_name: &str, fired: &TimerHandle) {
        if timer_name != TCC_TIMER_NAME {
            warn!(
                session_id = %self.session_id,
                timer_name,
                "expiry for unknown timer ignored"
            );
            return;
        }

        let guard = self.inner.lock();
        let current = guard.borrow().data.timer_handle().cloned();
        if current.as_ref() != Some(fired) {
            debug!(session_id = %self.session_id, "stale Tcc expiry ignored");
            return;
        }

        ccas_metrics::TCC_EXPIRIES_TOTAL.inc();
        self.context.on_supervision_timer_expired(self);

        guard.borrow_mut().data.set_timer_handle(None);
        self.set_state_with(SessionState::Idle, false);
    }

    fn start_tcc(&self, validity_secs: Option<u32>) {
        let secs = validity_secs.unwrap_or_else(|| self.context.default_validity_time_secs());
        let timeout_ms = u64::from(secs) * 2 * 1000;

        let guard = self.inner.lock();
        let restarting = guard.borrow().data.timer_handle().is_some();
        if restarting {
            self.stop_tcc(true);
        }
        let handle = self
            .timers
            .schedule(&self.session_id, TCC_TIMER_NAME, timeout_ms);
        guard.borrow_mut().data.set_timer_handle(Some(handle));
        drop(guard);

        if restarting {
            self.context.on_supervision_timer_restarted(self);
        } else {
            self.context.on_supervision_timer_started(self);
        }
    }

    fn stop_tcc(&self, will_restart: bool) {
        let guard = self.inner.lock();
        let handle = guard.borrow().data.timer_handle().cloned();
        let Some(handle) = handle else {
            return;
        };
        // cancel before clearing, so a callback racing in still finds a
        // handle to compare against and no-ops
        self.timers.cancel(&handle);
        guard.borrow_mut().data.set_timer_handle(None);
        drop(guard);

        if !will_restart {
            self.context.on_supervision_timer_stopped(self);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop supervision and detach the transport, listener and factory
    /// references. Safe to call more than once.
    pub fn release(&self) {
        let guard = self.inner.lock();
        self.stop_tcc(false);
        let mut inner = guard.borrow_mut();
        inner.sender = None;
        inner.listener = None;
        inner.factory = None;
    }

    fn set_state(&self, next: SessionState) {
        self.set_state_with(next, true);
    }

    fn set_state_with(&self, next: SessionState, release: bool) {
        let guard = self.inner.lock();
        let old = {
            let mut inner = guard.borrow_mut();
            let old = inner.data.state();
            inner.data.set_state(next);
            old
        };
        drop(guard);

        if old != next {
            debug!(
                session_id = %self.session_id,
                from = ?old,
                to = ?next,
                "session state changed"
            );
            match (old, next) {
                (SessionState::Idle, SessionState::Open) => ccas_metrics::SESSIONS_OPEN.inc(),
                (SessionState::Open, SessionState::Idle) => ccas_metrics::SESSIONS_OPEN.dec(),
                _ => {}
            }
        }

        if next == SessionState::Idle {
            self.stop_tcc(false);
            if release {
                self.release();
            }
        }
    }

    // ------------------------------------------------------------------
    // Transition effects
    // ------------------------------------------------------------------

    fn deliver_credit_control_request(&self, event: &Event) -> Result<Option<SessionState>> {
        let request = event
            .credit_control_request()
            .ok_or_else(|| CcasError::Internal("event carries no request".to_string()))?;
        let listener = self.listener()?;
        listener.on_credit_control_request(self, request);
        Ok(None)
    }

    fn sent_event_response(&self, event: &Event) -> Result<Option<SessionState>> {
        let answer = event
            .credit_control_answer()
            .ok_or_else(|| CcasError::Internal("event carries no answer".to_string()))?;
        self.dispatch_outgoing(answer.message());
        Ok(Some(SessionState::Idle))
    }

    fn sent_initial_response(&self, event: &Event) -> Result<Option<SessionState>> {
        let answer = event
            .credit_control_answer()
            .ok_or_else(|| CcasError::Internal("event carries no answer".to_string()))?;
        let result_code = answer.result_code()?;

        let next = if is_success(result_code) {
            self.start_tcc(self.validity_or_default(answer));
            SessionState::Open
        } else {
            SessionState::Idle
        };
        self.dispatch_outgoing(answer.message());
        Ok(Some(next))
    }

    fn sent_update_response(&self, event: &Event) -> Result<Option<SessionState>> {
        let answer = event
            .credit_control_answer()
            .ok_or_else(|| CcasError::Internal("event carries no answer".to_string()))?;
        let result_code = answer.result_code()?;

        if is_success(result_code) {
            self.start_tcc(self.validity_or_default(answer));
        }
        // on failure the timer keeps running; Tcc expiry will close the
        // session if no successful update follows
        self.dispatch_outgoing(answer.message());
        Ok(None)
    }

    fn sent_terminate_response(&self, event: &Event) -> Result<Option<SessionState>> {
        let answer = event
            .credit_control_answer()
            .ok_or_else(|| CcasError::Internal("event carries no answer".to_string()))?;
        let result_code = answer.result_code()?;

        let next = if is_success(result_code) {
            self.stop_tcc(false);
            Some(SessionState::Idle)
        } else {
            // failure tolerated, the session stays under Tcc supervision
            None
        };
        self.dispatch_outgoing(answer.message());
        Ok(next)
    }

    fn deliver_re_auth_answer(&self, event: &Event) -> Result<Option<SessionState>> {
        let Event::ReceivedReAuthAnswer(request, answer) = event else {
            return Err(CcasError::Internal(
                "event carries no re-auth exchange".to_string(),
            ));
        };
        let listener = self.listener()?;
        listener.on_re_auth_answer(self, request, answer);
        Ok(None)
    }

    fn sent_re_auth_request(&self, event: &Event) -> Result<Option<SessionState>> {
        let Event::SentReAuthRequest(request) = event else {
            return Err(CcasError::Internal(
                "event carries no re-auth request".to_string(),
            ));
        };
        self.dispatch_outgoing(request.message());
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Validity-Time with fallback: absent or undecodable AVP falls back to
    /// the context default (the transition must still complete).
    fn validity_or_default(&self, answer: &CreditControlAnswer) -> Option<u32> {
        match answer.validity_time() {
            Ok(validity) => validity,
            Err(error) => {
                debug!(
                    session_id = %self.session_id,
                    error = %error,
                    "unable to read Validity-Time AVP, using default"
                );
                None
            }
        }
    }

    fn dispatch_outgoing(&self, message: &DiameterMessage) {
        let sender = {
            let guard = self.inner.lock();
            let sender = guard.borrow().sender.clone();
            sender
        };
        match sender {
            Some(sender) => match sender.send(message.clone()) {
                Ok(()) => ccas_metrics::ANSWERS_DISPATCHED_TOTAL.inc(),
                Err(error) => {
                    debug!(
                        session_id = %self.session_id,
                        error = %error,
                        "failure trying to dispatch outgoing message"
                    );
                }
            },
            None => {
                debug!(
                    session_id = %self.session_id,
                    "no transport attached, dropping outgoing message"
                );
            }
        }
    }

    fn listener(&self) -> Result<Arc<dyn CcSessionListener>> {
        let guard = self.inner.lock();
        let listener = guard.borrow().listener.clone();
        listener.ok_or_else(|| CcasError::SessionReleased(self.session_id.clone()))
    }

    fn factory(&self) -> Result<Arc<dyn CcMessageFactory>> {
        let guard = self.inner.lock();
        let factory = guard.borrow().factory.clone();
        factory.ok_or_else(|| CcasError::SessionReleased(self.session_id.clone()))
    }
}

impl fmt::Debug for ServerCcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCcSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("active_timer", &self.has_active_timer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TimerHandle;
    use crate::events::{CcRequestType, CreditControlRequest, ReAuthAnswer};
    use ccas_shared::{
        Avp, AVP_CC_REQUEST_TYPE, AVP_RESULT_CODE, AVP_VALIDITY_TIME,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // ---- fakes -------------------------------------------------------

    struct FakeFactory {
        application_ids: Vec<u32>,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                application_ids: vec![4],
            }
        }
    }

    impl CcMessageFactory for FakeFactory {
        fn create_credit_control_request(
            &self,
            raw: DiameterMessage,
        ) -> Result<CreditControlRequest> {
            CreditControlRequest::new(raw)
        }

        fn create_re_auth_request(&self, raw: DiameterMessage) -> Result<ReAuthRequest> {
            Ok(ReAuthRequest::new(raw))
        }

        fn create_re_auth_answer(&self, raw: DiameterMessage) -> Result<ReAuthAnswer> {
            Ok(ReAuthAnswer::new(raw))
        }

        fn application_ids(&self) -> Vec<u32> {
            self.application_ids.clone()
        }
    }

    #[derive(Debug, PartialEq)]
    enum ListenerCall {
        CreditControl(CcRequestType),
        ReAuth,
        Other,
    }

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<ListenerCall>>,
    }

    impl CcSessionListener for RecordingListener {
        fn on_credit_control_request(
            &self,
            _session: &ServerCcSession,
            request: &CreditControlRequest,
        ) {
            self.calls
                .lock()
                .push(ListenerCall::CreditControl(request.request_type()));
        }

        fn on_re_auth_answer(
            &self,
            _session: &ServerCcSession,
            _request: &ReAuthRequest,
            _answer: &ReAuthAnswer,
        ) {
            self.calls.lock().push(ListenerCall::ReAuth);
        }

        fn on_other_event(
            &self,
            _session: &ServerCcSession,
            _request: Option<&DiameterMessage>,
            _answer: Option<&DiameterMessage>,
        ) {
            self.calls.lock().push(ListenerCall::Other);
        }
    }

    struct RecordingContext {
        default_validity: u32,
        notifications: Mutex<Vec<&'static str>>,
    }

    impl RecordingContext {
        fn new(default_validity: u32) -> Self {
            Self {
                default_validity,
                notifications: Mutex::new(Vec::new()),
            }
        }
    }

    impl CcSessionContext for RecordingContext {
        fn default_validity_time_secs(&self) -> u32 {
            self.default_validity
        }

        fn on_supervision_timer_started(&self, _session: &ServerCcSession) {
            self.notifications.lock().push("started");
        }

        fn on_supervision_timer_restarted(&self, _session: &ServerCcSession) {
            self.notifications.lock().push("restarted");
        }

        fn on_supervision_timer_stopped(&self, _session: &ServerCcSession) {
            self.notifications.lock().push("stopped");
        }

        fn on_supervision_timer_expired(&self, _session: &ServerCcSession) {
            self.notifications.lock().push("expired");
        }

        fn on_request_timed_out(&self, _request: &DiameterMessage) {
            self.notifications.lock().push("request-timeout");
        }
    }

    #[derive(Default)]
    struct FakeTimers {
        next_id: AtomicU64,
        scheduled: Mutex<Vec<(String, &'static str, u64)>>,
        cancelled: Mutex<Vec<TimerHandle>>,
    }

    impl FakeTimers {
        fn last_handle(&self) -> TimerHandle {
            TimerHandle::new(self.next_id.load(Ordering::SeqCst))
        }
    }

    impl TimerFacility for FakeTimers {
        fn schedule(
            &self,
            session_id: &str,
            timer_name: &'static str,
            delay_ms: u64,
        ) -> TimerHandle {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.scheduled
                .lock()
                .push((session_id.to_string(), timer_name, delay_ms));
            TimerHandle::new(id)
        }

        fn cancel(&self, handle: &TimerHandle) {
            self.cancelled.lock().push(handle.clone());
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<DiameterMessage>>,
        fail: AtomicBool,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: DiameterMessage) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CcasError::Internal("transport unavailable".to_string()));
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct Harness {
        session: Arc<ServerCcSession>,
        listener: Arc<RecordingListener>,
        context: Arc<RecordingContext>,
        timers: Arc<FakeTimers>,
        sender: Arc<RecordingSender>,
    }

    fn harness() -> Harness {
        harness_with_validity(30)
    }

    fn harness_with_validity(default_validity: u32) -> Harness {
        let listener = Arc::new(RecordingListener::default());
        let context = Arc::new(RecordingContext::new(default_validity));
        let timers = Arc::new(FakeTimers::default());
        let sender = Arc::new(RecordingSender::default());
        let session = Arc::new(
            ServerCcSession::new(
                "ccas;1096298391;1",
                SessionData::new(false),
                Arc::new(FakeFactory::new()),
                listener.clone(),
                context.clone(),
                timers.clone(),
                sender.clone(),
            )
            .unwrap(),
        );
        Harness {
            session,
            listener,
            context,
            timers,
            sender,
        }
    }

    fn assert_invariant(session: &ServerCcSession) {
        if session.has_active_timer() {
            assert_eq!(session.state(), SessionState::Open);
        }
        if session.state() == SessionState::Idle {
            assert!(!session.has_active_timer());
        }
    }

    // ---- message builders --------------------------------------------

    fn ccr(request_type: u32) -> DiameterMessage {
        let mut msg = DiameterMessage::new(CMD_CREDIT_CONTROL, true);
        msg.set_avp(Avp::unsigned32(AVP_CC_REQUEST_TYPE, request_type));
        msg
    }

    fn cca(request_type: u32, result_code: u32, validity: Option<u32>) -> CreditControlAnswer {
        let mut msg = DiameterMessage::new(CMD_CREDIT_CONTROL, false);
        msg.set_avp(Avp::unsigned32(AVP_CC_REQUEST_TYPE, request_type));
        msg.set_avp(Avp::unsigned32(AVP_RESULT_CODE, result_code));
        if let Some(validity) = validity {
            msg.set_avp(Avp::unsigned32(AVP_VALIDITY_TIME, validity));
        }
        CreditControlAnswer::new(msg)
    }

    fn open_session(h: &Harness) {
        h.session
            .send_credit_control_answer(cca(1, 2001, Some(300)))
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Open);
    }

    // ---- transition table --------------------------------------------

    #[test]
    fn initial_request_invokes_listener_and_stays_idle() {
        let h = harness();
        h.session
            .handle_event(Event::from_received_request(
                CreditControlRequest::new(ccr(1)).unwrap(),
            ))
            .unwrap();

        assert_eq!(
            *h.listener.calls.lock(),
            vec![ListenerCall::CreditControl(CcRequestType::Initial)]
        );
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
        assert_invariant(&h.session);
    }

    #[test]
    fn successful_initial_answer_opens_and_starts_tcc() {
        let h = harness();
        h.session
            .send_credit_control_answer(cca(1, 2001, Some(300)))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
        // 2 x 300 s, in milliseconds
        let scheduled = h.timers.scheduled.lock();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1, TCC_TIMER_NAME);
        assert_eq!(scheduled[0].2, 600_000);
        assert_eq!(*h.context.notifications.lock(), vec!["started"]);
        assert_eq!(h.sender.sent.lock().len(), 1);
        assert_invariant(&h.session);
    }

    #[test]
    fn failed_initial_answer_stays_idle_and_releases() {
        let h = harness();
        h.session
            .send_credit_control_answer(cca(1, 5012, None))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
        assert!(h.timers.scheduled.lock().is_empty());
        // the failure answer still goes out
        assert_eq!(h.sender.sent.lock().len(), 1);
        assert!(h.session.is_released());
        assert_invariant(&h.session);
    }

    #[test]
    fn absent_validity_falls_back_to_context_default() {
        let h = harness_with_validity(30);
        h.session
            .send_credit_control_answer(cca(1, 2001, None))
            .unwrap();

        assert_eq!(h.timers.scheduled.lock()[0].2, 60_000);
    }

    #[test]
    fn malformed_validity_falls_back_to_context_default() {
        let h = harness_with_validity(30);
        let mut msg = DiameterMessage::new(CMD_CREDIT_CONTROL, false);
        msg.set_avp(Avp::unsigned32(AVP_CC_REQUEST_TYPE, 1));
        msg.set_avp(Avp::unsigned32(AVP_RESULT_CODE, 2001));
        msg.set_avp(Avp {
            code: AVP_VALIDITY_TIME,
            flags: 0x40,
            vendor_id: None,
            data: bytes::Bytes::from_static(&[0xff, 0xff]),
        });

        h.session
            .send_credit_control_answer(CreditControlAnswer::new(msg))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        assert_eq!(h.timers.scheduled.lock()[0].2, 60_000);
    }

    #[test]
    fn update_answer_success_restarts_tcc() {
        let h = harness();
        open_session(&h);
        let first_handle = h.timers.last_handle();

        h.session
            .send_credit_control_answer(cca(2, 2001, Some(120)))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        // old timer cancelled exactly once, restart notified, no second start
        assert_eq!(*h.timers.cancelled.lock(), vec![first_handle]);
        assert_eq!(
            *h.context.notifications.lock(),
            vec!["started", "restarted"]
        );
        assert_eq!(h.timers.scheduled.lock()[1].2, 240_000);
        assert_invariant(&h.session);
    }

    #[test]
    fn update_answer_failure_keeps_running_timer() {
        let h = harness();
        open_session(&h);

        h.session
            .send_credit_control_answer(cca(2, 4012, None))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
        assert_eq!(h.timers.scheduled.lock().len(), 1);
        assert!(h.timers.cancelled.lock().is_empty());
        assert_eq!(h.sender.sent.lock().len(), 2);
        assert_invariant(&h.session);
    }

    #[test]
    fn terminate_answer_success_stops_tcc_and_releases() {
        let h = harness();
        open_session(&h);

        h.session
            .send_credit_control_answer(cca(3, 2001, None))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
        assert_eq!(h.timers.cancelled.lock().len(), 1);
        assert_eq!(
            *h.context.notifications.lock(),
            vec!["started", "stopped"]
        );
        assert!(h.session.is_released());
        assert_eq!(h.sender.sent.lock().len(), 2);
        assert_invariant(&h.session);
    }

    #[test]
    fn terminate_answer_failure_stays_open() {
        let h = harness();
        open_session(&h);

        h.session
            .send_credit_control_answer(cca(3, 5012, None))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
        assert!(!h.session.is_released());
        assert_invariant(&h.session);
    }

    #[test]
    fn event_request_flow_releases_after_answer() {
        let h = harness();
        h.session
            .handle_event(Event::from_received_request(
                CreditControlRequest::new(ccr(4)).unwrap(),
            ))
            .unwrap();
        assert_eq!(
            *h.listener.calls.lock(),
            vec![ListenerCall::CreditControl(CcRequestType::Event)]
        );

        h.session
            .send_credit_control_answer(cca(4, 2001, None))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.timers.scheduled.lock().is_empty());
        assert_eq!(h.sender.sent.lock().len(), 1);
        assert!(h.session.is_released());
    }

    #[test]
    fn re_auth_answer_delivered_in_open() {
        let h = harness();
        open_session(&h);

        let rar = ReAuthRequest::new(DiameterMessage::new(CMD_RE_AUTH, true));
        let raa = ReAuthAnswer::new(DiameterMessage::new(CMD_RE_AUTH, false));
        h.session
            .handle_event(Event::ReceivedReAuthAnswer(rar, raa))
            .unwrap();

        assert!(h.listener.calls.lock().contains(&ListenerCall::ReAuth));
        assert_eq!(h.session.state(), SessionState::Open);
    }

    #[test]
    fn sent_re_auth_request_dispatches_outgoing() {
        let h = harness();
        open_session(&h);

        h.session
            .send_re_auth_request(ReAuthRequest::new(DiameterMessage::new(CMD_RE_AUTH, true)))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        let sent = h.sender.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].is_rar());
    }

    // ---- ordering errors ---------------------------------------------

    #[test]
    fn update_in_idle_is_rejected_without_mutation() {
        let h = harness();
        let result = h.session.handle_event(Event::from_received_request(
            CreditControlRequest::new(ccr(2)).unwrap(),
        ));

        match result {
            Err(CcasError::UnexpectedEvent { state, kind, .. }) => {
                assert_eq!(state, SessionState::Idle);
                assert_eq!(kind, EventKind::ReceivedUpdate);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
        assert!(h.listener.calls.lock().is_empty());
        assert!(!h.session.is_released());
    }

    #[test]
    fn initial_request_in_open_is_rejected() {
        let h = harness();
        open_session(&h);

        let result = h.session.handle_event(Event::from_received_request(
            CreditControlRequest::new(ccr(1)).unwrap(),
        ));
        assert!(matches!(
            result,
            Err(CcasError::UnexpectedEvent { state: SessionState::Open, .. })
        ));
        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
    }

    #[test]
    fn re_auth_answer_in_idle_is_rejected() {
        let h = harness();
        let rar = ReAuthRequest::new(DiameterMessage::new(CMD_RE_AUTH, true));
        let raa = ReAuthAnswer::new(DiameterMessage::new(CMD_RE_AUTH, false));

        assert!(h
            .session
            .handle_event(Event::ReceivedReAuthAnswer(rar, raa))
            .is_err());
        assert!(h.listener.calls.lock().is_empty());
    }

    // ---- timer expiry ------------------------------------------------

    #[test]
    fn tcc_expiry_forces_idle_without_release() {
        let h = harness();
        open_session(&h);
        let handle = h.timers.last_handle();

        h.session.on_timer_expired(TCC_TIMER_NAME, &handle);

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
        assert!(h.context.notifications.lock().contains(&"expired"));
        // the expiry path clears the handle first, so no "stopped"
        assert!(!h.context.notifications.lock().contains(&"stopped"));
        assert!(!h.session.is_released());
        assert_invariant(&h.session);
    }

    #[test]
    fn stale_tcc_expiry_is_ignored() {
        let h = harness();
        open_session(&h);
        let stale = h.timers.last_handle();

        // restart replaces the handle
        h.session
            .send_credit_control_answer(cca(2, 2001, Some(60)))
            .unwrap();

        h.session.on_timer_expired(TCC_TIMER_NAME, &stale);

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
        assert!(!h.context.notifications.lock().contains(&"expired"));
        assert_invariant(&h.session);
    }

    #[test]
    fn unknown_timer_name_is_ignored() {
        let h = harness();
        open_session(&h);

        h.session
            .on_timer_expired("SOME_OTHER_TIMER", &h.timers.last_handle());

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
    }

    // ---- release -----------------------------------------------------

    #[test]
    fn release_is_idempotent() {
        let h = harness();
        open_session(&h);

        h.session.release();
        h.session.release();

        let notifications = h.context.notifications.lock();
        assert_eq!(
            notifications.iter().filter(|n| **n == "stopped").count(),
            1
        );
        assert!(h.session.is_released());
        assert!(!h.session.has_active_timer());
    }

    #[test]
    fn release_without_timer_does_not_notify_stopped() {
        let h = harness();
        h.session.release();

        assert!(h.context.notifications.lock().is_empty());
        assert!(h.session.is_released());
    }

    // ---- dispatcher task bodies --------------------------------------

    #[test]
    fn process_request_routes_ccr_to_fsm() {
        let h = harness();
        h.session.process_request(ccr(1));

        assert_eq!(
            *h.listener.calls.lock(),
            vec![ListenerCall::CreditControl(CcRequestType::Initial)]
        );
    }

    #[test]
    fn process_request_routes_other_commands_to_listener() {
        let h = harness();
        // 271 = ACR, not handled by this state machine
        h.session.process_request(DiameterMessage::new(271, true));

        assert_eq!(*h.listener.calls.lock(), vec![ListenerCall::Other]);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn process_request_swallows_decode_errors() {
        let h = harness();
        // CCR without a CC-Request-Type AVP
        h.session
            .process_request(DiameterMessage::new(CMD_CREDIT_CONTROL, true));

        assert!(h.listener.calls.lock().is_empty());
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.has_active_timer());
    }

    #[test]
    fn process_answer_routes_raa_to_fsm() {
        let h = harness();
        open_session(&h);

        h.session.process_answer(
            DiameterMessage::new(CMD_RE_AUTH, true),
            DiameterMessage::new(CMD_RE_AUTH, false),
        );

        assert!(h.listener.calls.lock().contains(&ListenerCall::ReAuth));
    }

    #[test]
    fn process_answer_routes_other_commands_to_listener() {
        let h = harness();
        h.session.process_answer(
            DiameterMessage::new(271, true),
            DiameterMessage::new(271, false),
        );

        assert_eq!(*h.listener.calls.lock(), vec![ListenerCall::Other]);
    }

    #[test]
    fn request_timeout_is_forwarded_to_context() {
        let h = harness();
        h.session
            .request_timed_out(&DiameterMessage::new(CMD_RE_AUTH, true));

        assert_eq!(
            *h.context.notifications.lock(),
            vec!["request-timeout"]
        );
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    // ---- send failures -----------------------------------------------

    #[test]
    fn send_failure_does_not_roll_back_transition() {
        let h = harness();
        h.sender.fail.store(true, Ordering::SeqCst);

        h.session
            .send_credit_control_answer(cca(1, 2001, Some(300)))
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Open);
        assert!(h.session.has_active_timer());
        assert!(h.sender.sent.lock().is_empty());
    }

    // ---- reentrancy --------------------------------------------------

    struct AnsweringListener;

    impl CcSessionListener for AnsweringListener {
        fn on_credit_control_request(
            &self,
            session: &ServerCcSession,
            request: &CreditControlRequest,
        ) {
            // answer synchronously, from inside the delivery callback
            let mut msg = DiameterMessage::new(CMD_CREDIT_CONTROL, false);
            msg.set_avp(Avp::unsigned32(
                AVP_CC_REQUEST_TYPE,
                request.request_type().code(),
            ));
            msg.set_avp(Avp::unsigned32(AVP_RESULT_CODE, 2001));
            msg.set_avp(Avp::unsigned32(AVP_VALIDITY_TIME, 60));
            session
                .send_credit_control_answer(CreditControlAnswer::new(msg))
                .unwrap();
        }

        fn on_re_auth_answer(
            &self,
            _session: &ServerCcSession,
            _request: &ReAuthRequest,
            _answer: &ReAuthAnswer,
        ) {
        }

        fn on_other_event(
            &self,
            _session: &ServerCcSession,
            _request: Option<&DiameterMessage>,
            _answer: Option<&DiameterMessage>,
        ) {
        }
    }

    #[test]
    fn listener_may_reenter_session_to_answer() {
        let context = Arc::new(RecordingContext::new(30));
        let timers = Arc::new(FakeTimers::default());
        let sender = Arc::new(RecordingSender::default());
        let session = ServerCcSession::new(
            "ccas;reentrant;1",
            SessionData::new(false),
            Arc::new(FakeFactory::new()),
            Arc::new(AnsweringListener),
            context.clone(),
            timers.clone(),
            sender.clone(),
        )
        .unwrap();

        // delivery triggers the nested send_credit_control_answer on the
        // same thread, through the same lock
        session.process_request(ccr(1));

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(timers.scheduled.lock()[0].2, 120_000);
        assert_eq!(sender.sent.lock().len(), 1);
        assert_invariant(&session);
    }

    // ---- construction ------------------------------------------------

    #[test]
    fn construction_fails_with_empty_application_ids() {
        struct EmptyFactory;
        impl CcMessageFactory for EmptyFactory {
            fn create_credit_control_request(
                &self,
                raw: DiameterMessage,
            ) -> Result<CreditControlRequest> {
                CreditControlRequest::new(raw)
            }
            fn create_re_auth_request(&self, raw: DiameterMessage) -> Result<ReAuthRequest> {
                Ok(ReAuthRequest::new(raw))
            }
            fn create_re_auth_answer(&self, raw: DiameterMessage) -> Result<ReAuthAnswer> {
                Ok(ReAuthAnswer::new(raw))
            }
            fn application_ids(&self) -> Vec<u32> {
                Vec::new()
            }
        }

        let result = ServerCcSession::new(
            "ccas;bad;1",
            SessionData::new(false),
            Arc::new(EmptyFactory),
            Arc::new(RecordingListener::default()),
            Arc::new(RecordingContext::new(30)),
            Arc::new(FakeTimers::default()),
            Arc::new(RecordingSender::default()),
        );
        assert!(matches!(result, Err(CcasError::InvalidWiring(_))));
    }

    #[test]
    fn construction_adopts_factory_application_ids() {
        let h = harness();
        assert_eq!(h.session.authorized_application_ids(), vec![4]);
        assert!(!h.session.is_stateless());
    }
}
