use ccas_core::{CcasError, MessageSender, Result};
use ccas_shared::DiameterMessage;
use tokio::sync::mpsc;

/// Outbound send path backed by an unbounded channel. The transport side
/// drains the receiver; sending never blocks the session lock.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<DiameterMessage>,
}

impl ChannelSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DiameterMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, message: DiameterMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| CcasError::Internal("transport channel closed".to_string()))
    }
}
