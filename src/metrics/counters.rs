//! Counter helpers

use super::labels;

/// Record an operation outcome
pub fn operation_finished(op: &'static str, outcome: &'static str) {
    metrics::counter!(labels::OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}

/// Record a kill dispatch result
pub fn kill_dispatched(result: &'static str) {
    metrics::counter!(labels::KILLS_TOTAL, "result" => result).increment(1);
}

/// Record a kill failure
pub fn kill_failed(kind: &'static str) {
    metrics::counter!(labels::KILL_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record a session identity lookup
pub fn identity_resolved(result: &'static str) {
    metrics::counter!(labels::IDENTITY_RESOLUTION_TOTAL, "result" => result).increment(1);
}
