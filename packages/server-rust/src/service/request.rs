//! Per-request lifecycle record.

use std::sync::Arc;

use terminal_core::TerminalMessage;
use tokio::time::Instant;

use super::runtime::ServiceRuntime;
use super::sink::OutputSink;
use crate::terminal::dispose::InFlightGuard;

/// Identifier of a request within one terminal, assigned at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Lifecycle state of a request.
///
/// State machine:
/// `Initialized -> Routed -> Pending -> Processing -> Processed -> Finalized`,
/// with rejections jumping from `Initialized` or `Routed` straight to
/// `Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    Initialized,
    Routed,
    Pending,
    Processing,
    Processed,
    Finalized,
}

/// Transition timestamps. Each is unset until its transition fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub initialized_at: Option<Instant>,
    pub routed_at: Option<Instant>,
    pub processing_at: Option<Instant>,
    pub processed_at: Option<Instant>,
    pub finalized_at: Option<Instant>,
}

/// Mutable record for one inbound request.
///
/// Owned by the dispatcher for the whole lifecycle; it moves into the pending
/// queue or into the executing task and comes back on completion.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    message: TerminalMessage,
    sink: OutputSink,
    service: Option<Arc<ServiceRuntime>>,
    state: RequestState,
    timestamps: Timestamps,
    _in_flight: InFlightGuard,
}

impl RequestContext {
    /// Creates a context in the `Initialized` state, stamped now.
    pub(crate) fn new(
        id: RequestId,
        message: TerminalMessage,
        sink: OutputSink,
        in_flight: InFlightGuard,
    ) -> Self {
        Self {
            id,
            message,
            sink,
            service: None,
            state: RequestState::Initialized,
            timestamps: Timestamps {
                initialized_at: Some(Instant::now()),
                ..Timestamps::default()
            },
            _in_flight: in_flight,
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn message(&self) -> &TerminalMessage {
        &self.message
    }

    #[must_use]
    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// The service runtime this request was routed to, if any.
    #[must_use]
    pub fn service(&self) -> Option<&Arc<ServiceRuntime>> {
        self.service.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.state
    }

    #[must_use]
    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub(crate) fn bind(&mut self, runtime: Arc<ServiceRuntime>) {
        self.service = Some(runtime);
    }

    /// Moves to `next`, stamping the matching timestamp.
    ///
    /// Transitions only ever move forward; finalizing closes the sink.
    pub(crate) fn transition(&mut self, next: RequestState) {
        debug_assert!(
            next > self.state,
            "request {:?} moved backwards: {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        let now = Instant::now();
        match next {
            RequestState::Initialized => self.timestamps.initialized_at = Some(now),
            RequestState::Routed => self.timestamps.routed_at = Some(now),
            RequestState::Pending => {}
            RequestState::Processing => self.timestamps.processing_at = Some(now),
            RequestState::Processed => self.timestamps.processed_at = Some(now),
            RequestState::Finalized => {
                self.timestamps.finalized_at = Some(now);
                self.sink.close();
            }
        }
        self.state = next;
    }

    /// Time between initialization and finalization, once both are stamped.
    #[must_use]
    pub fn duration(&self) -> Option<std::time::Duration> {
        let start = self.timestamps.initialized_at?;
        let end = self.timestamps.finalized_at?;
        Some(end.saturating_duration_since(start))
    }
}
