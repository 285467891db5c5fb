use std::time::Duration;

use crate::telemetry::LogFormat;

/// Terminal-level configuration for the dispatch core.
///
/// Controls the terminal identity, handler timeout windows, the heartbeat
/// period for queued requests, and logging setup.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Unique identifier of this terminal on the bus. Stamped as the source
    /// of every reply.
    pub terminal_id: String,
    /// Period between heartbeats sent to requests waiting in a pending queue.
    pub heartbeat_interval: Duration,
    /// A handler must emit its first fragment or complete within this window.
    pub first_output_timeout: Duration,
    /// After any fragment, the next fragment or completion must arrive within
    /// this window.
    pub idle_output_timeout: Duration,
    /// Bounded capacity of the dispatcher's event mailbox.
    pub event_channel_capacity: usize,
    /// `EnvFilter` directive used by [`crate::telemetry::init_tracing`].
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            terminal_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(5),
            first_output_timeout: Duration::from_secs(30),
            idle_output_timeout: Duration::from_secs(10),
            event_channel_capacity: 1024,
            log_filter: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}
