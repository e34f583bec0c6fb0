use crate::data::SessionState;
use crate::events::EventKind;
use thiserror::Error;

/// Main error type for the credit-control session layer
#[derive(Error, Debug)]
pub enum CcasError {
    // ========================================
    // Decode Errors
    // ========================================
    #[error("Missing required AVP: {0}")]
    MissingAvp(u32),

    #[error("Invalid AVP value for code {code}: {reason}")]
    InvalidAvpValue { code: u32, reason: String },

    // ========================================
    // Protocol Ordering Errors
    // ========================================
    #[error("Event {kind:?} is not legal in state {state:?}: {detail}")]
    UnexpectedEvent {
        state: SessionState,
        kind: EventKind,
        detail: String,
    },

    // ========================================
    // Lifecycle / Wiring Errors
    // ========================================
    #[error("Session {0} has been released")]
    SessionReleased(String),

    #[error("Invalid session wiring: {0}")]
    InvalidWiring(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CcasError {
    /// Convert error to Diameter Result-Code
    pub fn to_result_code(&self) -> u32 {
        match self {
            Self::MissingAvp(_) => 5005,           // DIAMETER_MISSING_AVP
            Self::InvalidAvpValue { .. } => 5004,  // DIAMETER_INVALID_AVP_VALUE
            Self::UnexpectedEvent { .. } => 5012,  // DIAMETER_UNABLE_TO_COMPLY
            Self::SessionReleased(_) => 5002,      // DIAMETER_UNKNOWN_SESSION_ID
            _ => 5012,
        }
    }

    /// Decode and ordering errors are peer-observable protocol conditions;
    /// wiring errors are programmer mistakes that should fail loudly.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MissingAvp(_) | Self::InvalidAvpValue { .. } | Self::UnexpectedEvent { .. }
        )
    }
}

/// Result type alias for session-layer operations
pub type Result<T> = std::result::Result<T, CcasError>;
