//! Terminal Server: service registry, request lifecycle dispatch, admission
//! control, and handler execution for one message-bus terminal.

pub mod service;
pub mod telemetry;
pub mod terminal;
pub mod traits;

pub use service::{
    DispatchError, ExecutionError, Limit, OutputSink, ServiceDescriptor, ServiceOptions,
    ServiceStats, TerminalConfig,
};
pub use terminal::dispose::TerminalState;
pub use terminal::TerminalServer;
pub use traits::{MetricsSink, OutboundSink, RequestTags, TransportError};
