//! Per-service runtime bookkeeping: pending queue, processing set, counters.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use terminal_core::ServiceOutput;

use super::descriptor::{Limit, ServiceDescriptor};
use super::request::{RequestContext, RequestId, RequestState};

/// Outcome of admitting a routed request to a service.
#[derive(Debug)]
pub(crate) enum Admission {
    /// A slot was taken; the request may start processing now.
    Ready(RequestContext),
    /// No free slot; the request now waits in the pending queue.
    Queued,
    /// The pending queue is full. The request was not enqueued.
    Rejected(RequestContext),
}

/// Point-in-time view of a service's runtime counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub service_id: String,
    pub method: String,
    pub pending: usize,
    pub processing: usize,
    pub total_routed: u64,
    pub total_processed: u64,
    pub concurrency: Limit,
    pub capacity: Limit,
}

#[derive(Debug, Default)]
struct RuntimeState {
    pending: VecDeque<RequestContext>,
    processing: HashSet<RequestId>,
    total_routed: u64,
    total_processed: u64,
}

/// Mutable scheduling state for one registered service.
///
/// Invariants: `processing.len() <= concurrency` and, at admission time,
/// `pending.len() < capacity`. Only dispatcher transitions and the heartbeat
/// tick touch the state; the lock is never held while a handler runs.
#[derive(Debug)]
pub struct ServiceRuntime {
    descriptor: Arc<ServiceDescriptor>,
    concurrency: Limit,
    capacity: Limit,
    state: Mutex<RuntimeState>,
}

impl ServiceRuntime {
    pub(crate) fn new(descriptor: Arc<ServiceDescriptor>) -> Self {
        let options = descriptor.options();
        Self {
            descriptor,
            concurrency: options.concurrency,
            capacity: options.capacity,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        self.descriptor.service_id()
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let state = self.state.lock();
        ServiceStats {
            service_id: self.descriptor.service_id().to_string(),
            method: self.descriptor.method().to_string(),
            pending: state.pending.len(),
            processing: state.processing.len(),
            total_routed: state.total_routed,
            total_processed: state.total_processed,
            concurrency: self.concurrency,
            capacity: self.capacity,
        }
    }

    pub(crate) fn record_routed(&self) {
        self.state.lock().total_routed += 1;
    }

    /// Capacity check followed by slot acquisition, as one atomic step.
    pub(crate) fn admit(&self, mut ctx: RequestContext) -> Admission {
        let mut state = self.state.lock();
        if !self.capacity.allows(state.pending.len()) {
            return Admission::Rejected(ctx);
        }
        ctx.transition(RequestState::Pending);
        if self.concurrency.allows(state.processing.len()) {
            state.processing.insert(ctx.id());
            Admission::Ready(ctx)
        } else {
            state.pending.push_back(ctx);
            Admission::Queued
        }
    }

    /// Releases the slot held by `id` and hands it to the longest-waiting
    /// pending request, if any.
    pub(crate) fn release(&self, id: RequestId) -> Option<RequestContext> {
        let mut state = self.state.lock();
        state.processing.remove(&id);
        state.total_processed += 1;

        if !self.concurrency.allows(state.processing.len()) {
            return None;
        }
        let next = state.pending.pop_front()?;
        state.processing.insert(next.id());
        Some(next)
    }

    /// Sends an empty fragment to every queued request. Returns how many were
    /// delivered.
    pub(crate) fn heartbeat_pending(&self) -> usize {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .filter(|ctx| ctx.sink().send(ServiceOutput::Heartbeat).is_ok())
            .count()
    }

    /// Drops every queued request without finalizing it. Used on disposal.
    pub(crate) fn abandon_pending(&self) -> usize {
        let abandoned = std::mem::take(&mut self.state.lock().pending);
        abandoned.len()
    }
}
