//! Histogram helpers

use super::labels;
use std::time::Duration;

/// Record how long one kill command took
pub fn kill_duration(elapsed: Duration) {
    metrics::histogram!(labels::KILL_DURATION_MS).record(elapsed.as_secs_f64() * 1000.0);
}

/// Record the delay between a context firing and the caller seeing it
pub fn cancellation_latency(op: &'static str, elapsed: Duration) {
    metrics::histogram!(labels::CANCELLATION_LATENCY_MS, "op" => op)
        .record(elapsed.as_secs_f64() * 1000.0);
}
