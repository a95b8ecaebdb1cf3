//! Metric names and label values

/// Operations counter
pub const OPERATIONS_TOTAL: &str = "cancellable_sql_operations_total";
/// Kill dispatch counter
pub const KILLS_TOTAL: &str = "cancellable_sql_kills_total";
/// Kill failure counter
pub const KILL_ERRORS_TOTAL: &str = "cancellable_sql_kill_errors_total";
/// Kill duration histogram
pub const KILL_DURATION_MS: &str = "cancellable_sql_kill_duration_ms";
/// Cancellation latency histogram
pub const CANCELLATION_LATENCY_MS: &str = "cancellable_sql_cancellation_latency_ms";
/// Identity resolution counter
pub const IDENTITY_RESOLUTION_TOTAL: &str = "cancellable_sql_identity_resolution_total";

/// Kill was sent and acknowledged
pub const KILL_SENT: &str = "sent";
/// Kill failed or timed out
pub const KILL_FAILED: &str = "failed";
/// Kill already in flight for the session
pub const KILL_COALESCED: &str = "coalesced";
/// Call drained before the kill went out
pub const KILL_SKIPPED: &str = "skipped";
