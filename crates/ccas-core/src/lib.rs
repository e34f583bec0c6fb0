// Error types module
pub mod error;

// Session data holder and state enumeration
pub mod data;

// Typed FSM events and decoded message wrappers
pub mod events;

// Collaborator contracts (factory, listener, context, timers, transport)
pub mod contracts;

// Server credit-control session state machine
pub mod session;

// Re-export commonly used types
pub use contracts::{
    CcMessageFactory, CcSessionContext, CcSessionListener, MessageSender, TimerFacility,
};
pub use data::{SessionData, SessionState, TimerHandle};
pub use error::{CcasError, Result};
pub use events::{
    CcRequestType, CreditControlAnswer, CreditControlRequest, Event, EventKind, ReAuthAnswer,
    ReAuthRequest,
};
pub use session::{ServerCcSession, TCC_TIMER_NAME};
