//! Service descriptors: the (method, validator, handler, limits) tuple a
//! terminal registers to serve requests.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use terminal_core::{ResponseBody, ServiceOutput, TerminalMessage};

use super::sink::OutputSink;

/// Predicate over a request payload, used to pick one service among several
/// sharing a method name.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Fragments produced by a handler. An `Err` item ends the execution with a
/// 500 response.
pub type HandlerStream = BoxStream<'static, anyhow::Result<ServiceOutput>>;

/// Opaque service logic. Receives the request and a write-only handle to the
/// caller's output sink, and returns a stream of fragments.
pub type Handler = Arc<dyn Fn(TerminalMessage, OutputSink) -> HandlerStream + Send + Sync>;

// ---------------------------------------------------------------------------
// Limit
// ---------------------------------------------------------------------------

/// Upper bound on a per-service quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// No limit.
    #[default]
    Unbounded,
    /// At most this many. `Bounded(0)` admits nothing.
    Bounded(usize),
}

impl Limit {
    /// Converts a configured value, treating `0` as "not configured".
    #[must_use]
    pub fn from_config(value: usize) -> Self {
        if value == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(value)
        }
    }

    /// Returns `true` if one more unit fits when `current` are already in use.
    #[must_use]
    pub fn allows(self, current: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(max) => current < max,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Bounded(max) => write!(f, "{max}"),
        }
    }
}

/// Per-service scheduling limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceOptions {
    /// Maximum simultaneous handler executions.
    pub concurrency: Limit,
    /// Maximum requests waiting for a concurrency slot.
    pub capacity: Limit,
}

// ---------------------------------------------------------------------------
// ServiceDescriptor
// ---------------------------------------------------------------------------

/// A registered service.
///
/// `service_id` is unique within a terminal and defaults to the method name;
/// several services may share a method and are told apart by their validators.
#[derive(Clone)]
pub struct ServiceDescriptor {
    service_id: String,
    method: String,
    validator: Validator,
    handler: Handler,
    options: ServiceOptions,
}

impl ServiceDescriptor {
    /// Creates a streaming service for `method` that accepts every payload.
    pub fn new<F, S>(method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TerminalMessage, OutputSink) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<ServiceOutput>> + Send + 'static,
    {
        let method = method.into();
        Self {
            service_id: method.clone(),
            method,
            validator: Arc::new(|_: &Value| true),
            handler: Arc::new(move |msg: TerminalMessage, sink: OutputSink| {
                handler(msg, sink).boxed()
            }),
            options: ServiceOptions::default(),
        }
    }

    /// Creates a service whose handler resolves to a single terminal response.
    pub fn unary<F, Fut>(method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TerminalMessage, OutputSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ResponseBody>> + Send + 'static,
    {
        Self::new(method, move |msg, sink| {
            stream::once(handler(msg, sink)).map(|res| res.map(ServiceOutput::Response))
        })
    }

    /// Overrides the service id. An empty id falls back to the method name.
    #[must_use]
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        let service_id = service_id.into();
        if !service_id.is_empty() {
            self.service_id = service_id;
        }
        self
    }

    #[must_use]
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Shorthand for a bounded concurrency; `0` means unbounded.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = Limit::from_config(concurrency);
        self
    }

    /// Shorthand for a bounded pending capacity; `0` means unbounded.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.options.capacity = Limit::from_config(capacity);
        self
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn options(&self) -> ServiceOptions {
        self.options
    }

    /// Runs the validator against a request payload.
    #[must_use]
    pub fn accepts(&self, payload: &Value) -> bool {
        (self.validator)(payload)
    }

    /// Invokes the handler. May panic if the handler does; the execution
    /// wrapper is responsible for isolating that.
    pub(crate) fn invoke(&self, message: TerminalMessage, sink: OutputSink) -> HandlerStream {
        (self.handler)(message, sink)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_id", &self.service_id)
            .field("method", &self.method)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
