//! Terminal Core: message envelope, service outputs, and response codes shared
//! by every participant on the message bus.

pub mod codes;
pub mod messages;

pub use messages::{ReplyEnvelope, ResponseBody, ServiceOutput, TerminalMessage};
