//! Request dispatch core.
//!
//! 1. **Registry** (`registry`): services by id and by method, plus runtimes
//! 2. **Runtime** (`runtime`): per-service pending queue and concurrency slots
//! 3. **Dispatcher** (`dispatcher`): the request lifecycle reducer
//! 4. **Execution** (`execution`): handler invocation under timeouts
//! 5. **Heartbeat** (`heartbeat`): keep-alive for queued requests
//! 6. **Background worker** (`worker`): hosts the reducer and its tick

pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod execution;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod runtime;
pub mod sink;
pub mod worker;

// Re-export key types for convenient access.
pub use config::TerminalConfig;
pub use descriptor::{Handler, HandlerStream, Limit, ServiceDescriptor, ServiceOptions, Validator};
pub use dispatcher::{DispatchError, DispatchEvent};
pub use execution::{ExecutionError, HandlerExecutor, TimeoutPolicy};
pub use heartbeat::HeartbeatTicker;
pub use metrics::{describe_metrics, FacadeMetrics};
pub use registry::ServiceRegistry;
pub use request::{RequestContext, RequestId, RequestState, Timestamps};
pub use runtime::{ServiceRuntime, ServiceStats};
pub use sink::{OutputSink, SinkError};
pub use worker::{BackgroundRunnable, BackgroundWorker};
