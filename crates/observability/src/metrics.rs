//! In-process cron metrics.
//!
//! The scheduler reports through [`CronMetrics`]; [`CronMetricsRegistry`]
//! keeps per-job counters and duration samples behind a mutex so tests and
//! health endpoints can read them back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Sink for per-job outcomes.
pub trait CronMetrics: Send + Sync {
    fn job_succeeded(&self, job: &str);
    fn job_failed(&self, job: &str);
    fn job_duration(&self, job: &str, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCronMetrics;

impl CronMetrics for NoopCronMetrics {
    fn job_succeeded(&self, _job: &str) {}
    fn job_failed(&self, _job: &str) {}
    fn job_duration(&self, _job: &str, _elapsed: Duration) {}
}

/// Point-in-time view of one job's metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobMetricsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub durations: Vec<Duration>,
}

impl JobMetricsSnapshot {
    pub fn runs(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Mutex-guarded map of job name to metrics.
#[derive(Debug, Clone, Default)]
pub struct CronMetricsRegistry {
    jobs: Arc<Mutex<HashMap<String, JobMetricsSnapshot>>>,
}

impl CronMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<R>(&self, job: &str, f: impl FnOnce(&mut JobMetricsSnapshot) -> R) -> R {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        f(jobs.entry(job.to_string()).or_default())
    }

    /// Metrics recorded for `job` so far (zeroes if it never ran).
    pub fn snapshot(&self, job: &str) -> JobMetricsSnapshot {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(job).cloned().unwrap_or_default()
    }

    /// Sum of successes and failures across all jobs.
    pub fn total_runs(&self) -> u64 {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.values().map(JobMetricsSnapshot::runs).sum()
    }
}

impl CronMetrics for CronMetricsRegistry {
    fn job_succeeded(&self, job: &str) {
        self.with_job(job, |m| m.succeeded += 1);
    }

    fn job_failed(&self, job: &str) {
        self.with_job(job, |m| m.failed += 1);
    }

    fn job_duration(&self, job: &str, elapsed: Duration) {
        self.with_job(job, |m| m.durations.push(elapsed));
    }
}
