//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Cron job counters and durations.
pub mod metrics;

pub use metrics::{CronMetrics, CronMetricsRegistry, JobMetricsSnapshot, NoopCronMetrics};
