//! Metrics for the cancellation layer
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.
//!
//! # Metrics
//! - `cancellable_sql_operations_total` (counter): operations by op and outcome
//! - `cancellable_sql_kills_total` (counter): kill dispatch results
//! - `cancellable_sql_kill_errors_total` (counter): kill failures by kind
//! - `cancellable_sql_kill_duration_ms` (histogram): time to run one kill
//! - `cancellable_sql_cancellation_latency_ms` (histogram): context fire to caller return
//! - `cancellable_sql_identity_resolution_total` (counter): identity lookups by result

pub mod counters;
pub mod histograms;
pub mod labels;
