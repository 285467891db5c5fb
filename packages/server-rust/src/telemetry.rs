//! Structured logging setup for processes embedding a terminal.

use std::io::{self, IsTerminal};

use serde::{Deserialize, Serialize};
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Subscriber;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::service::config::TerminalConfig;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// One JSON object per event, fields flattened.
    Json,
}

/// Errors encountered while configuring logging.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Resolves the effective filter: `RUST_LOG` when set, else the configured
/// directive.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] if the directive does not parse.
pub fn env_filter(config: &TerminalConfig) -> Result<EnvFilter, TelemetryError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.log_filter),
    }
    .map_err(|err| TelemetryError::Filter(err.to_string()))
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// # Errors
///
/// Fails if the filter is invalid or a global subscriber is already set.
pub fn init_tracing(config: &TerminalConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
