use std::time::Duration;

use terminal_core::TerminalMessage;
use tokio::sync::mpsc;

/// Error returned when the transport refuses an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport's receiving end has been dropped.
    #[error("transport disconnected")]
    Disconnected,
    /// The bounded outbound queue is full.
    #[error("transport outbound queue is full")]
    Full,
}

/// Outbound half of the terminal transport.
///
/// Sends must not block: they are issued from inside dispatcher transitions
/// and heartbeat ticks.
pub trait OutboundSink: Send + Sync {
    /// Hand one fully-addressed message to the transport.
    fn send(&self, message: TerminalMessage) -> Result<(), TransportError>;
}

impl OutboundSink for mpsc::UnboundedSender<TerminalMessage> {
    fn send(&self, message: TerminalMessage) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| TransportError::Disconnected)
    }
}

impl OutboundSink for mpsc::Sender<TerminalMessage> {
    fn send(&self, message: TerminalMessage) -> Result<(), TransportError> {
        self.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Disconnected,
        })
    }
}

/// Labels attached to every request metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTags {
    pub method: String,
    pub source_terminal_id: String,
    /// Always this terminal's own id.
    pub target_terminal_id: String,
}

/// Receiver of request counters and duration observations.
///
/// Implementations: `metrics` facade (production), in-memory recorders (tests).
pub trait MetricsSink: Send + Sync {
    /// A request message was accepted for dispatch.
    fn request_received(&self, tags: &RequestTags);

    /// A request finalized `elapsed` after initialization with response `code`.
    fn request_duration(&self, tags: &RequestTags, code: u16, elapsed: Duration);
}
