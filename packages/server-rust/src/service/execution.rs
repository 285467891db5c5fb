//! Handler execution wrapper.
//!
//! Runs a service handler under a two-window timeout policy and converts any
//! failure (error item, panic, timeout) into a single 500 response fragment.
//! Nothing escapes: `execute` always returns normally.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use terminal_core::{codes, ServiceOutput, TerminalMessage};
use tracing::{debug, warn};

use super::config::TerminalConfig;
use super::descriptor::ServiceDescriptor;
use super::sink::{OutputSink, SinkError};

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Reasons a handler execution ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Handler Timeout: no output within {timeout_ms}ms: method={method} target={target}")]
    FirstOutputTimeout {
        timeout_ms: u128,
        method: String,
        target: String,
    },
    #[error("Handler Timeout: idle for {timeout_ms}ms: method={method} target={target}")]
    IdleTimeout {
        timeout_ms: u128,
        method: String,
        target: String,
    },
    #[error("{0:#}")]
    Handler(anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// TimeoutPolicy
// ---------------------------------------------------------------------------

/// The handler must produce its first fragment (or finish) within `first`, and
/// each following fragment (or completion) within `each`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub first: Duration,
    pub each: Duration,
}

impl From<&TerminalConfig> for TimeoutPolicy {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            first: config.first_output_timeout,
            each: config.idle_output_timeout,
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from(&TerminalConfig::default())
    }
}

// ---------------------------------------------------------------------------
// HandlerExecutor
// ---------------------------------------------------------------------------

/// Invokes handlers with timeout enforcement and error isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerExecutor {
    policy: TimeoutPolicy,
}

impl HandlerExecutor {
    #[must_use]
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    /// Runs `descriptor`'s handler for `message`, forwarding its fragments to
    /// `sink`. On failure a single `500 Internal Server Error: ...` response is
    /// written instead of propagating.
    ///
    /// Returns the failure, if any, for the caller's bookkeeping.
    pub async fn execute(
        &self,
        descriptor: &ServiceDescriptor,
        message: TerminalMessage,
        sink: OutputSink,
    ) -> Option<ExecutionError> {
        let err = self.drive(descriptor, &message, &sink).await.err()?;

        warn!(
            trace_id = %message.trace_id,
            method = %message.method_name(),
            service_id = %descriptor.service_id(),
            source_terminal_id = %message.source_terminal_id,
            error = %err,
            "handler failed"
        );
        let response = ServiceOutput::response(
            codes::INTERNAL_SERVER_ERROR,
            format!("Internal Server Error: {err}"),
        );
        forward(&sink, response);
        Some(err)
    }

    async fn drive(
        &self,
        descriptor: &ServiceDescriptor,
        message: &TerminalMessage,
        sink: &OutputSink,
    ) -> Result<(), ExecutionError> {
        let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            descriptor.invoke(message.clone(), sink.clone())
        }));
        let mut stream =
            invoked.map_err(|payload| ExecutionError::Panicked(panic_message(&*payload)))?;

        let mut emitted = false;
        loop {
            let window = if emitted { self.policy.each } else { self.policy.first };
            let next = AssertUnwindSafe(stream.next()).catch_unwind();
            let item = match tokio::time::timeout(window, next).await {
                Err(_elapsed) => return Err(self.timeout_error(emitted, message)),
                Ok(Err(payload)) => {
                    return Err(ExecutionError::Panicked(panic_message(&*payload)));
                }
                Ok(Ok(item)) => item,
            };
            match item {
                None => return Ok(()),
                Some(Ok(output)) => {
                    emitted = true;
                    forward(sink, output);
                }
                Some(Err(err)) => return Err(ExecutionError::Handler(err)),
            }
        }
    }

    fn timeout_error(&self, emitted: bool, message: &TerminalMessage) -> ExecutionError {
        let method = message.method_name().to_string();
        let target = message.source_terminal_id.clone();
        if emitted {
            ExecutionError::IdleTimeout {
                timeout_ms: self.policy.each.as_millis(),
                method,
                target,
            }
        } else {
            ExecutionError::FirstOutputTimeout {
                timeout_ms: self.policy.first.as_millis(),
                method,
                target,
            }
        }
    }
}

fn forward(sink: &OutputSink, output: ServiceOutput) {
    if let Err(err) = sink.send(output) {
        match err {
            SinkError::Closed => {
                debug!(trace_id = %sink.trace_id(), "dropping fragment for closed sink");
            }
            SinkError::Transport(err) => {
                debug!(trace_id = %sink.trace_id(), error = %err, "transport refused fragment");
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::stream;
    use serde_json::json;
    use terminal_core::{ReplyEnvelope, ResponseBody};
    use tokio::sync::mpsc;

    use super::*;

    fn request() -> TerminalMessage {
        TerminalMessage::request("t-1", "Slow", json!({}), "caller", "host")
    }

    fn sink() -> (OutputSink, mpsc::UnboundedReceiver<TerminalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let envelope = ReplyEnvelope::for_request(&request(), "host");
        (OutputSink::new(envelope, Arc::new(tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TerminalMessage>) -> Vec<TerminalMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn run(
        descriptor: &ServiceDescriptor,
    ) -> (Option<ExecutionError>, Vec<TerminalMessage>) {
        let (sink, mut rx) = sink();
        let err = HandlerExecutor::default()
            .execute(descriptor, request(), sink)
            .await;
        (err, drain(&mut rx))
    }

    #[tokio::test]
    async fn forwards_stream_fragments_in_order() {
        let svc = ServiceDescriptor::new("Slow", |_msg, _sink| {
            stream::iter(vec![
                Ok(ServiceOutput::Frame(json!(1))),
                Ok(ServiceOutput::Frame(json!(2))),
                Ok(ServiceOutput::response(0, "OK")),
            ])
        });
        let (err, out) = run(&svc).await;
        assert!(err.is_none());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].frame, Some(json!(1)));
        assert_eq!(out[1].frame, Some(json!(2)));
        assert_eq!(out[2].res.as_ref().unwrap().code, 0);
    }

    #[tokio::test]
    async fn handler_may_write_to_the_sink_directly() {
        let svc = ServiceDescriptor::unary("Slow", |_msg, sink: OutputSink| async move {
            sink.frame(json!("progress"))?;
            anyhow::Ok(ResponseBody::new(0, "done"))
        });
        let (err, out) = run(&svc).await;
        assert!(err.is_none());
        assert_eq!(out[0].frame, Some(json!("progress")));
        assert_eq!(out[1].res.as_ref().unwrap().message, "done");
    }

    #[tokio::test]
    async fn error_item_becomes_single_500() {
        let svc = ServiceDescriptor::unary("Slow", |_msg, _sink| async {
            Err::<ResponseBody, _>(anyhow::anyhow!("database unreachable"))
        });
        let (err, out) = run(&svc).await;
        assert!(matches!(err, Some(ExecutionError::Handler(_))));
        assert_eq!(out.len(), 1);
        let res = out[0].res.as_ref().unwrap();
        assert_eq!(res.code, codes::INTERNAL_SERVER_ERROR);
        assert_eq!(res.message, "Internal Server Error: database unreachable");
    }

    #[tokio::test]
    async fn synchronous_panic_is_isolated() {
        type Never = stream::Empty<anyhow::Result<ServiceOutput>>;
        let svc = ServiceDescriptor::new("Slow", |_msg, _sink| -> Never {
            panic!("handler exploded")
        });
        let (err, out) = run(&svc).await;
        assert!(matches!(err, Some(ExecutionError::Panicked(ref m)) if m == "handler exploded"));
        assert_eq!(out.len(), 1);
        assert!(out[0].res.as_ref().unwrap().message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn panic_while_streaming_is_isolated() {
        let svc = ServiceDescriptor::unary("Slow", |_msg, _sink| async {
            if true {
                panic!("mid-flight");
            }
            anyhow::Ok(ResponseBody::new(0, "unreachable"))
        });
        let (err, out) = run(&svc).await;
        assert!(matches!(err, Some(ExecutionError::Panicked(_))));
        assert_eq!(out[0].res.as_ref().unwrap().code, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handler_times_out_after_first_window() {
        let svc = ServiceDescriptor::new("Slow", |_msg, _sink| stream::pending());
        let started = tokio::time::Instant::now();
        let (err, out) = run(&svc).await;

        assert!(matches!(
            err,
            Some(ExecutionError::FirstOutputTimeout { timeout_ms: 30_000, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        let res = out[0].res.as_ref().unwrap();
        assert_eq!(res.code, 500);
        assert!(res.message.contains("Handler Timeout"));
        assert!(res.message.contains("method=Slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_after_idle_window() {
        let svc = ServiceDescriptor::new("Slow", |_msg, _sink| {
            stream::once(async { anyhow::Ok(ServiceOutput::Frame(json!("first"))) })
                .chain(stream::pending())
        });
        let started = tokio::time::Instant::now();
        let (err, out) = run(&svc).await;

        assert!(matches!(
            err,
            Some(ExecutionError::IdleTimeout { timeout_ms: 10_000, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].frame, Some(json!("first")));
        assert_eq!(out[1].res.as_ref().unwrap().code, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_steady_stream_is_not_timed_out() {
        let svc = ServiceDescriptor::new("Slow", |_msg, _sink| {
            stream::unfold(0u32, |n| async move {
                if n == 4 {
                    return None;
                }
                tokio::time::sleep(Duration::from_secs(8)).await;
                Some((Ok(ServiceOutput::Frame(json!(n))), n + 1))
            })
        });
        let (err, out) = run(&svc).await;
        assert!(err.is_none());
        assert_eq!(out.len(), 4);
    }
}
