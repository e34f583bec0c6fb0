use crate::error::{CcasError, Result};
use ccas_shared::{
    DiameterMessage, AVP_CC_REQUEST_TYPE, AVP_RESULT_CODE, AVP_VALIDITY_TIME,
    CC_REQUEST_TYPE_EVENT, CC_REQUEST_TYPE_INITIAL, CC_REQUEST_TYPE_TERMINATION,
    CC_REQUEST_TYPE_UPDATE,
};

/// CC-Request-Type AVP value (RFC 4006)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcRequestType {
    Initial,
    Update,
    Termination,
    Event,
}

impl CcRequestType {
    pub fn from_avp(value: u32) -> Result<Self> {
        match value {
            CC_REQUEST_TYPE_INITIAL => Ok(Self::Initial),
            CC_REQUEST_TYPE_UPDATE => Ok(Self::Update),
            CC_REQUEST_TYPE_TERMINATION => Ok(Self::Termination),
            CC_REQUEST_TYPE_EVENT => Ok(Self::Event),
            other => Err(CcasError::InvalidAvpValue {
                code: AVP_CC_REQUEST_TYPE,
                reason: format!("unknown CC-Request-Type {other}"),
            }),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Initial => CC_REQUEST_TYPE_INITIAL,
            Self::Update => CC_REQUEST_TYPE_UPDATE,
            Self::Termination => CC_REQUEST_TYPE_TERMINATION,
            Self::Event => CC_REQUEST_TYPE_EVENT,
        }
    }
}

/// Decoded credit-control request (CCR)
#[derive(Debug, Clone)]
pub struct CreditControlRequest {
    message: DiameterMessage,
    request_type: CcRequestType,
}

impl CreditControlRequest {
    pub fn new(message: DiameterMessage) -> Result<Self> {
        let value = message
            .get_u32(AVP_CC_REQUEST_TYPE)
            .ok_or(CcasError::MissingAvp(AVP_CC_REQUEST_TYPE))?;
        let request_type = CcRequestType::from_avp(value)?;
        Ok(Self {
            message,
            request_type,
        })
    }

    pub fn request_type(&self) -> CcRequestType {
        self.request_type
    }

    pub fn message(&self) -> &DiameterMessage {
        &self.message
    }
}

/// Outgoing credit-control answer (CCA)
#[derive(Debug, Clone)]
pub struct CreditControlAnswer {
    message: DiameterMessage,
}

impl CreditControlAnswer {
    pub fn new(message: DiameterMessage) -> Self {
        Self { message }
    }

    pub fn request_type(&self) -> Result<CcRequestType> {
        let value = self
            .message
            .get_u32(AVP_CC_REQUEST_TYPE)
            .ok_or(CcasError::MissingAvp(AVP_CC_REQUEST_TYPE))?;
        CcRequestType::from_avp(value)
    }

    pub fn result_code(&self) -> Result<u32> {
        let avp = self
            .message
            .get_avp(AVP_RESULT_CODE)
            .ok_or(CcasError::MissingAvp(AVP_RESULT_CODE))?;
        avp.as_u32().ok_or(CcasError::InvalidAvpValue {
            code: AVP_RESULT_CODE,
            reason: format!("payload of {} bytes is not an Unsigned32", avp.data.len()),
        })
    }

    /// Validity-Time in seconds. Absent AVP is `Ok(None)`; a present but
    /// malformed AVP is an error so the caller can decide on a fallback.
    pub fn validity_time(&self) -> Result<Option<u32>> {
        match self.message.get_avp(AVP_VALIDITY_TIME) {
            None => Ok(None),
            Some(avp) => avp
                .as_u32()
                .map(Some)
                .ok_or(CcasError::InvalidAvpValue {
                    code: AVP_VALIDITY_TIME,
                    reason: format!("payload of {} bytes is not an Unsigned32", avp.data.len()),
                }),
        }
    }

    pub fn message(&self) -> &DiameterMessage {
        &self.message
    }
}

/// Decoded re-authorization request (RAR)
#[derive(Debug, Clone)]
pub struct ReAuthRequest {
    message: DiameterMessage,
}

impl ReAuthRequest {
    pub fn new(message: DiameterMessage) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &DiameterMessage {
        &self.message
    }
}

/// Decoded re-authorization answer (RAA)
#[derive(Debug, Clone)]
pub struct ReAuthAnswer {
    message: DiameterMessage,
}

impl ReAuthAnswer {
    pub fn new(message: DiameterMessage) -> Self {
        Self { message }
    }

    pub fn result_code(&self) -> Result<u32> {
        let avp = self
            .message
            .get_avp(AVP_RESULT_CODE)
            .ok_or(CcasError::MissingAvp(AVP_RESULT_CODE))?;
        avp.as_u32().ok_or(CcasError::InvalidAvpValue {
            code: AVP_RESULT_CODE,
            reason: format!("payload of {} bytes is not an Unsigned32", avp.data.len()),
        })
    }

    pub fn message(&self) -> &DiameterMessage {
        &self.message
    }
}

/// Discriminant used for transition-table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReceivedInitial,
    ReceivedEvent,
    ReceivedUpdate,
    ReceivedTerminate,
    SentEventResponse,
    SentInitialResponse,
    SentUpdateResponse,
    SentTerminateResponse,
    ReceivedReAuthAnswer,
    SentReAuthRequest,
}

/// One thing that happened to the session. Immutable, single-use, created at
/// the point of dispatch and discarded after processing.
#[derive(Debug, Clone)]
pub enum Event {
    ReceivedInitial(CreditControlRequest),
    ReceivedEvent(CreditControlRequest),
    ReceivedUpdate(CreditControlRequest),
    ReceivedTerminate(CreditControlRequest),
    SentEventResponse(CreditControlAnswer),
    SentInitialResponse(CreditControlAnswer),
    SentUpdateResponse(CreditControlAnswer),
    SentTerminateResponse(CreditControlAnswer),
    ReceivedReAuthAnswer(ReAuthRequest, ReAuthAnswer),
    SentReAuthRequest(ReAuthRequest),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ReceivedInitial(_) => EventKind::ReceivedInitial,
            Self::ReceivedEvent(_) => EventKind::ReceivedEvent,
            Self::ReceivedUpdate(_) => EventKind::ReceivedUpdate,
            Self::ReceivedTerminate(_) => EventKind::ReceivedTerminate,
            Self::SentEventResponse(_) => EventKind::SentEventResponse,
            Self::SentInitialResponse(_) => EventKind::SentInitialResponse,
            Self::SentUpdateResponse(_) => EventKind::SentUpdateResponse,
            Self::SentTerminateResponse(_) => EventKind::SentTerminateResponse,
            Self::ReceivedReAuthAnswer(_, _) => EventKind::ReceivedReAuthAnswer,
            Self::SentReAuthRequest(_) => EventKind::SentReAuthRequest,
        }
    }

    /// Classify an inbound CCR by its CC-Request-Type
    pub fn from_received_request(request: CreditControlRequest) -> Self {
        match request.request_type() {
            CcRequestType::Initial => Self::ReceivedInitial(request),
            CcRequestType::Update => Self::ReceivedUpdate(request),
            CcRequestType::Termination => Self::ReceivedTerminate(request),
            CcRequestType::Event => Self::ReceivedEvent(request),
        }
    }

    /// Classify an outgoing CCA by the CC-Request-Type it answers
    pub fn from_sent_answer(answer: CreditControlAnswer) -> Result<Self> {
        Ok(match answer.request_type()? {
            CcRequestType::Initial => Self::SentInitialResponse(answer),
            CcRequestType::Update => Self::SentUpdateResponse(answer),
            CcRequestType::Termination => Self::SentTerminateResponse(answer),
            CcRequestType::Event => Self::SentEventResponse(answer),
        })
    }

    pub(crate) fn credit_control_request(&self) -> Option<&CreditControlRequest> {
        match self {
            Self::ReceivedInitial(r)
            | Self::ReceivedEvent(r)
            | Self::ReceivedUpdate(r)
            | Self::ReceivedTerminate(r) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn credit_control_answer(&self) -> Option<&CreditControlAnswer> {
        match self {
            Self::SentEventResponse(a)
            | Self::SentInitialResponse(a)
            | Self::SentUpdateResponse(a)
            | Self::SentTerminateResponse(a) => Some(a),
            _ => None,
        }
    }
}
