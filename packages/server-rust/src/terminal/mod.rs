//! Terminal assembly: wires the input stream, the dispatcher worker, and the
//! outbound transport together, and exposes the service registration API.

pub mod dispose;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use terminal_core::TerminalMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::service::config::TerminalConfig;
use crate::service::descriptor::ServiceDescriptor;
use crate::service::dispatcher::{DispatchEvent, Dispatcher};
use crate::service::metrics::FacadeMetrics;
use crate::service::registry::ServiceRegistry;
use crate::service::runtime::ServiceStats;
use crate::service::worker::BackgroundWorker;
use crate::traits::{MetricsSink, OutboundSink};

use self::dispose::{wait_disposed, DisposeController, TerminalState};

/// One running terminal on the message bus.
///
/// Consumes requests from its input stream, dispatches them to registered
/// services, and writes every reply fragment to its outbound transport.
/// Dropping the server disposes it.
pub struct TerminalServer {
    config: TerminalConfig,
    registry: Arc<ServiceRegistry>,
    dispose: Arc<DisposeController>,
    worker: BackgroundWorker<Dispatcher>,
    pump: Option<JoinHandle<()>>,
}

impl TerminalServer {
    /// Starts a terminal that reports metrics through the `metrics` facade.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start<I, O>(config: TerminalConfig, input: I, output: O) -> Self
    where
        I: Stream<Item = TerminalMessage> + Send + 'static,
        O: OutboundSink + 'static,
    {
        Self::start_with_metrics(config, input, output, Arc::new(FacadeMetrics))
    }

    /// Starts a terminal reporting to `metrics`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start_with_metrics<I, O>(
        config: TerminalConfig,
        input: I,
        output: O,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self
    where
        I: Stream<Item = TerminalMessage> + Send + 'static,
        O: OutboundSink + 'static,
    {
        let registry = Arc::new(ServiceRegistry::new());
        let dispose = Arc::new(DisposeController::new());
        let (tx, rx) = mpsc::channel(config.event_channel_capacity.max(1));

        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&registry),
            metrics,
            Arc::new(output),
            tx.clone(),
            Arc::clone(&dispose),
        );
        let worker = BackgroundWorker::start(
            dispatcher,
            rx,
            config.heartbeat_interval,
            dispose.subscribe(),
        );
        let pump = tokio::spawn(pump_input(input, tx, dispose.subscribe()));

        dispose.set_running();
        info!(
            terminal_id = %config.terminal_id,
            heartbeat_ms = config.heartbeat_interval.as_millis(),
            "terminal started"
        );

        Self {
            config,
            registry,
            dispose,
            worker,
            pump: Some(pump),
        }
    }

    #[must_use]
    pub fn terminal_id(&self) -> &str {
        &self.config.terminal_id
    }

    #[must_use]
    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Registers a service. Returns the descriptor it replaced, if any.
    pub fn add_service(&self, descriptor: ServiceDescriptor) -> Option<Arc<ServiceDescriptor>> {
        self.registry.register(descriptor)
    }

    /// Stops routing new requests to a service. Requests it already accepted
    /// run to completion.
    pub fn remove_service(&self, service_id: &str) -> Option<Arc<ServiceDescriptor>> {
        self.registry.deregister(service_id)
    }

    /// Snapshot of registered services, keyed by service id.
    #[must_use]
    pub fn services(&self) -> HashMap<String, Arc<ServiceDescriptor>> {
        self.registry.services()
    }

    #[must_use]
    pub fn service_stats(&self, service_id: &str) -> Option<ServiceStats> {
        self.registry.stats(service_id)
    }

    /// Number of request contexts that are initialized and not yet finalized
    /// or abandoned.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.dispose.in_flight_count()
    }

    #[must_use]
    pub fn state(&self) -> TerminalState {
        self.dispose.state()
    }

    /// Stops consuming input and abandons in-flight requests without
    /// finalizing them. Idempotent.
    pub fn dispose(&self) {
        if self.dispose.dispose() {
            info!(
                terminal_id = %self.config.terminal_id,
                in_flight = self.dispose.in_flight_count(),
                "terminal disposed"
            );
        }
    }

    /// Waits until the dispatcher and the input pump have stopped.
    pub async fn join(&mut self) {
        self.worker.join().await;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

impl Drop for TerminalServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Forwards terminal input into the dispatcher mailbox until disposal or end
/// of input.
async fn pump_input<I>(
    input: I,
    events: mpsc::Sender<DispatchEvent>,
    mut dispose: watch::Receiver<bool>,
) where
    I: Stream<Item = TerminalMessage> + Send + 'static,
{
    let mut input = std::pin::pin!(input);
    loop {
        let next = tokio::select! {
            biased;
            () = wait_disposed(&mut dispose) => break,
            next = input.next() => next,
        };
        let Some(message) = next else {
            debug!("terminal input closed");
            break;
        };
        if events.send(DispatchEvent::Inbound(message)).await.is_err() {
            break;
        }
    }
}
