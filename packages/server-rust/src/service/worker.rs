//! Background worker hosting a single-threaded event reducer.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, with periodic tick
//! callbacks, until the terminal is disposed.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::terminal::dispose::wait_disposed;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Tasks and ticks are delivered one at a time, so implementors may treat
/// each call as an atomic step over their state.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Stops as soon as the dispose signal fires
/// 2. Calls `BackgroundRunnable::on_tick()` at the configured interval
/// 3. Calls `BackgroundRunnable::run()` for each task received
/// 4. Calls `BackgroundRunnable::shutdown()` on the way out
///
/// The caller creates the channel so the runnable itself can hold a sender
/// and post follow-up tasks to its own mailbox.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    handle: Option<JoinHandle<()>>,
    _runnable: PhantomData<fn() -> R>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the worker over the receiving half of an existing channel.
    pub fn start(
        mut runnable: R,
        mut rx: mpsc::Receiver<R::Task>,
        tick_interval: Duration,
        mut dispose: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut tick_interval = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                // The tick is polled ahead of the mailbox so a busy mailbox
                // cannot starve it; it is ready at most once per interval.
                tokio::select! {
                    biased;
                    () = wait_disposed(&mut dispose) => break,
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break, // Channel closed.
                        }
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            handle: Some(handle),
            _runnable: PhantomData,
        }
    }

    /// Wait for the worker task to exit. Does not itself stop the worker.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
