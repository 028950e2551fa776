//! Lock-guarded cron scheduler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bazaar_observability::CronMetrics;
use futures_util::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{CronJob, Registry};
use crate::error::{ServiceError, ServiceResult};
use crate::lock::DistributedLock;

/// Runs every registered job once per cycle while holding the distributed
/// lock. Jobs run sequentially in registration order; one failing or
/// panicking job never aborts the cycle.
pub struct Scheduler {
    registry: Registry,
    lock: Arc<DistributedLock>,
    metrics: Arc<dyn CronMetrics>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Registry,
        lock: Arc<DistributedLock>,
        metrics: Arc<dyn CronMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            lock,
            metrics,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one cycle immediately, then one per interval until `ctx` fires.
    /// Always ends with `Err(Cancelled)`.
    pub async fn run(&self, ctx: CancellationToken) -> ServiceResult<()> {
        info!(
            jobs = ?self.registry.names(),
            interval = ?self.interval,
            "cron scheduler started"
        );
        self.cycle_logged(&ctx).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = ticker.tick() => {}
            }
            if ctx.is_cancelled() {
                info!("cron scheduler stopping");
                return Err(ServiceError::Cancelled);
            }
            self.cycle_logged(&ctx).await;
        }
    }

    async fn cycle_logged(&self, ctx: &CancellationToken) {
        if let Err(err) = self.run_cycle(ctx).await {
            error!(error = %err, "cron cycle failed");
        }
    }

    /// One pass over all jobs. Returns `Ok` when the lock is held elsewhere;
    /// job failures are logged and counted, never returned.
    pub async fn run_cycle(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        if !self.lock.acquire().await? {
            info!(key = self.lock.key(), "another instance is running; skipping cycle");
            return Ok(());
        }

        for job in self.registry.jobs() {
            if ctx.is_cancelled() {
                warn!("cancelled; skipping remaining cron jobs");
                break;
            }
            self.run_job(job.as_ref(), ctx).await;
        }

        if let Err(err) = self.lock.release().await {
            warn!(error = %err, key = self.lock.key(), "failed to release cron lock");
        }
        Ok(())
    }

    async fn run_job(&self, job: &dyn CronJob, ctx: &CancellationToken) {
        let name = job.name();
        let started = Instant::now();
        info!(job = name, "cron job started");

        let outcome = AssertUnwindSafe(job.run(ctx)).catch_unwind().await;
        let elapsed = started.elapsed();
        self.metrics.job_duration(name, elapsed);

        match outcome {
            Ok(Ok(())) => {
                self.metrics.job_succeeded(name);
                info!(job = name, elapsed_ms = elapsed.as_millis() as u64, "cron job finished");
            }
            Ok(Err(err)) => {
                self.metrics.job_failed(name);
                error!(
                    job = name,
                    error = %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "cron job failed"
                );
            }
            Err(panic) => {
                self.metrics.job_failed(name);
                error!(job = name, panic = %panic_message(&*panic), "cron job panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
