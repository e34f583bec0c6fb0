// Tcc timer facility backed by the tokio timer wheel
pub mod timer;

// Inbound message dispatch onto the shared worker pool
pub mod dispatcher;

// Channel-backed outbound send path
pub mod sender;

// Config-backed session context
pub mod context;

pub use context::StaticSessionContext;
pub use dispatcher::EventDispatcher;
pub use sender::ChannelSender;
pub use timer::{run_expiry_driver, TimerExpiry, TokioTimerFacility};
