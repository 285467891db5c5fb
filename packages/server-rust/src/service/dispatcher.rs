//! Request lifecycle reducer.
//!
//! Every lifecycle transition runs inside [`Dispatcher`], which is hosted by a
//! [`BackgroundWorker`](super::worker::BackgroundWorker) and therefore handles
//! one event at a time. Handler bodies are the only concurrent part: each runs
//! in its own task and reports back with [`DispatchEvent::Processed`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use terminal_core::{codes, ReplyEnvelope, ResponseBody, TerminalMessage};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::config::TerminalConfig;
use super::execution::HandlerExecutor;
use super::heartbeat::HeartbeatTicker;
use super::registry::ServiceRegistry;
use super::request::{RequestContext, RequestId, RequestState};
use super::runtime::Admission;
use super::sink::OutputSink;
use super::worker::BackgroundRunnable;
use crate::terminal::dispose::{wait_disposed, DisposeController};
use crate::traits::{MetricsSink, OutboundSink, RequestTags};

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Routing and admission rejections. Each one becomes the request's only
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No service is registered for the method.
    #[error("Bad Request: Method Not Found")]
    MethodNotFound,
    /// Services exist for the method but no validator accepts the payload.
    #[error("Bad Request: No Matching Service")]
    NoMatchingService,
    /// More than one validator accepts the payload.
    #[error("Bad Request: Ambiguous Service")]
    AmbiguousService,
    /// The routed service has no runtime context.
    #[error("Internal Server Error: Service Not Found")]
    ServiceNotFound,
    /// The service's pending queue is at capacity.
    #[error("Service Unavailable")]
    Unavailable,
}

impl DispatchError {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::MethodNotFound | Self::NoMatchingService | Self::AmbiguousService => {
                codes::BAD_REQUEST
            }
            Self::ServiceNotFound => codes::INTERNAL_SERVER_ERROR,
            Self::Unavailable => codes::SERVICE_UNAVAILABLE,
        }
    }

    #[must_use]
    pub fn to_response(self) -> ResponseBody {
        ResponseBody::new(self.code(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// DispatchEvent
// ---------------------------------------------------------------------------

/// Input to the reducer.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A message arrived on the terminal input.
    Inbound(TerminalMessage),
    /// A handler execution ended (normally, with an error, or by timeout).
    Processed(RequestContext),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher {
    terminal_id: String,
    registry: Arc<ServiceRegistry>,
    metrics: Arc<dyn MetricsSink>,
    outbound: Arc<dyn OutboundSink>,
    executor: HandlerExecutor,
    heartbeat: HeartbeatTicker,
    events: mpsc::Sender<DispatchEvent>,
    dispose: Arc<DisposeController>,
    next_id: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &TerminalConfig,
        registry: Arc<ServiceRegistry>,
        metrics: Arc<dyn MetricsSink>,
        outbound: Arc<dyn OutboundSink>,
        events: mpsc::Sender<DispatchEvent>,
        dispose: Arc<DisposeController>,
    ) -> Self {
        Self {
            terminal_id: config.terminal_id.clone(),
            heartbeat: HeartbeatTicker::new(Arc::clone(&registry)),
            executor: HandlerExecutor::new(config.into()),
            registry,
            metrics,
            outbound,
            events,
            dispose,
            next_id: 0,
        }
    }

    fn on_inbound(&mut self, message: TerminalMessage) {
        if !message.is_request() {
            trace!(trace_id = %message.trace_id, "ignoring non-request message");
            return;
        }

        let id = RequestId(self.next_id);
        self.next_id += 1;
        let sink = OutputSink::new(
            ReplyEnvelope::for_request(&message, &self.terminal_id),
            Arc::clone(&self.outbound),
        );
        let ctx = RequestContext::new(id, message, sink, self.dispose.in_flight_guard());
        self.metrics.request_received(&self.tags(&ctx));
        self.route(ctx);
    }

    fn route(&self, mut ctx: RequestContext) {
        static NULL: Value = Value::Null;
        let message = ctx.message();
        let payload = message.req.as_ref().unwrap_or(&NULL);
        let runtime = match self.registry.resolve(message.method_name(), payload) {
            Ok(runtime) => runtime,
            Err(err) => return self.reject(ctx, err),
        };

        ctx.bind(Arc::clone(&runtime));
        ctx.transition(RequestState::Routed);
        runtime.record_routed();

        match runtime.admit(ctx) {
            Admission::Ready(ctx) => self.process(ctx),
            Admission::Queued => {
                trace!(service_id = %runtime.service_id(), "request queued");
            }
            Admission::Rejected(ctx) => self.reject(ctx, DispatchError::Unavailable),
        }
    }

    /// Starts the handler for a context that holds a concurrency slot.
    fn process(&self, mut ctx: RequestContext) {
        let Some(descriptor) = ctx.service().map(|rt| Arc::clone(rt.descriptor())) else {
            return self.reject(ctx, DispatchError::ServiceNotFound);
        };
        ctx.transition(RequestState::Processing);

        let executor = self.executor;
        let events = self.events.clone();
        let mut dispose = self.dispose.subscribe();
        tokio::spawn(async move {
            let message = ctx.message().clone();
            let sink = ctx.sink().clone();
            tokio::select! {
                biased;
                () = wait_disposed(&mut dispose) => {
                    debug!(
                        trace_id = %ctx.message().trace_id,
                        "terminal disposed, abandoning request"
                    );
                    return;
                }
                _ = executor.execute(&descriptor, message, sink) => {}
            }
            if events.send(DispatchEvent::Processed(ctx)).await.is_err() {
                debug!("dispatcher stopped before request completed");
            }
        });
    }

    fn on_processed(&self, mut ctx: RequestContext) {
        ctx.transition(RequestState::Processed);
        let next = ctx.service().and_then(|rt| rt.release(ctx.id()));
        self.finalize(ctx);
        if let Some(next) = next {
            self.process(next);
        }
    }

    fn reject(&self, ctx: RequestContext, err: DispatchError) {
        debug!(
            trace_id = %ctx.message().trace_id,
            method = %ctx.message().method_name(),
            code = err.code(),
            reason = %err,
            "request rejected"
        );
        if let Err(send_err) = ctx.sink().respond(err.to_response()) {
            debug!(
                trace_id = %ctx.message().trace_id,
                error = %send_err,
                "rejection not delivered"
            );
        }
        self.finalize(ctx);
    }

    fn finalize(&self, mut ctx: RequestContext) {
        ctx.transition(RequestState::Finalized);
        if let Some(elapsed) = ctx.duration() {
            let code = ctx
                .sink()
                .last_response_code()
                .unwrap_or(codes::NO_RESPONSE);
            self.metrics.request_duration(&self.tags(&ctx), code, elapsed);
        }
    }

    fn tags(&self, ctx: &RequestContext) -> RequestTags {
        RequestTags {
            method: ctx.message().method_name().to_string(),
            source_terminal_id: ctx.message().source_terminal_id.clone(),
            target_terminal_id: self.terminal_id.clone(),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for Dispatcher {
    type Task = DispatchEvent;

    async fn run(&mut self, task: DispatchEvent) {
        match task {
            DispatchEvent::Inbound(message) => self.on_inbound(message),
            DispatchEvent::Processed(ctx) => self.on_processed(ctx),
        }
    }

    async fn on_tick(&mut self) {
        self.heartbeat.tick();
    }

    async fn shutdown(&mut self) {
        let abandoned: usize = self
            .registry
            .runtimes()
            .iter()
            .map(|rt| rt.abandon_pending())
            .sum();
        debug!(
            terminal_id = %self.terminal_id,
            abandoned,
            "dispatcher stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
