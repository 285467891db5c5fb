//! Request metrics recorded through the `metrics` facade.
//!
//! Whatever recorder the embedding process installs (Prometheus exporter, test
//! recorder, none) receives the counter and histogram below.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use crate::traits::{MetricsSink, RequestTags};

/// Counter incremented once per accepted request message.
pub const REQUEST_RECEIVED_TOTAL: &str = "terminal_request_received_total";

/// Histogram of request durations, initialization to finalization.
pub const REQUEST_DURATION_MS: &str = "terminal_request_duration_milliseconds";

/// Registers metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        REQUEST_RECEIVED_TOTAL,
        Unit::Count,
        "Terminal request received"
    );
    describe_histogram!(
        REQUEST_DURATION_MS,
        Unit::Milliseconds,
        "Request duration bucket in 1, 10, 100, 1000, 10000 ms"
    );
}

/// [`MetricsSink`] backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn request_received(&self, tags: &RequestTags) {
        counter!(
            REQUEST_RECEIVED_TOTAL,
            "method" => tags.method.clone(),
            "source_terminal_id" => tags.source_terminal_id.clone(),
            "target_terminal_id" => tags.target_terminal_id.clone()
        )
        .increment(1);
    }

    fn request_duration(&self, tags: &RequestTags, code: u16, elapsed: Duration) {
        histogram!(
            REQUEST_DURATION_MS,
            "method" => tags.method.clone(),
            "source_terminal_id" => tags.source_terminal_id.clone(),
            "target_terminal_id" => tags.target_terminal_id.clone(),
            "code" => code.to_string()
        )
        .record(elapsed.as_secs_f64() * 1000.0);
    }
}
