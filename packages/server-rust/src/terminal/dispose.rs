//! Terminal lifecycle controller with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for in-flight request tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Terminal lifecycle state.
///
/// State machine: Starting -> Running -> Disposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Built but the dispatch loop has not started yet.
    Starting,
    /// Consuming input and dispatching requests.
    Running,
    /// Stopped. No further input is consumed and no further output is
    /// produced for requests that were still in flight.
    Disposed,
}

/// Controls terminal disposal and counts live request contexts.
///
/// 1. Every long-running task selects on a receiver from `subscribe()`
/// 2. `dispose()` moves to `Disposed` and wakes all of them
/// 3. Each request context holds an `InFlightGuard` until it is dropped
///
/// Disposal does not finalize requests. Abandoned contexts release their
/// guard when the task holding them is torn down.
#[derive(Debug)]
pub struct DisposeController {
    dispose_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<TerminalState>>,
}

impl DisposeController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            dispose_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(TerminalState::Starting)),
        }
    }

    /// Marks the terminal running, unless it was already disposed.
    pub fn set_running(&self) {
        self.state.rcu(|current| match **current {
            TerminalState::Disposed => Arc::clone(current),
            _ => Arc::new(TerminalState::Running),
        });
    }

    /// Signals every subscriber. Idempotent; returns `true` on the first call.
    pub fn dispose(&self) -> bool {
        let previous = self.state.swap(Arc::new(TerminalState::Disposed));
        // Stored even with no live receiver, so later subscribers see it.
        self.dispose_signal.send_replace(true);
        *previous != TerminalState::Disposed
    }

    #[must_use]
    pub fn state(&self) -> TerminalState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state() == TerminalState::Disposed
    }

    /// Returns a receiver that observes `true` once disposal starts.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.dispose_signal.subscribe()
    }

    /// Creates an RAII guard counting one live request context.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of request contexts currently alive.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for DisposeController {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` has observed disposal, or its controller is gone.
pub(crate) async fn wait_disposed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|disposed| *disposed).await;
}

/// Decrements the in-flight counter when dropped, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
