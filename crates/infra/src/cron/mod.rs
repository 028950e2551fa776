//! Periodic maintenance: the job contract, the registry, and the
//! lock-guarded scheduler that runs every registered job once per cycle.

pub mod jobs;
pub mod scheduler;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ServiceError, ServiceResult};

pub use scheduler::Scheduler;

/// A unit of periodic work.
///
/// `run` does a bounded amount of work and checks `ctx` between units so a
/// shutdown is observed promptly, even mid-loop.
#[async_trait]
pub trait CronJob: Send + Sync {
    /// Stable identifier used in logs and metrics.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()>;
}

/// Returns `Cancelled` once `ctx` has fired.
pub fn ensure_live(ctx: &CancellationToken) -> ServiceResult<()> {
    if ctx.is_cancelled() {
        Err(ServiceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Jobs in registration order, unique by name.
#[derive(Clone, Default)]
pub struct Registry {
    jobs: Vec<Arc<dyn CronJob>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `job`. `None` is ignored so optional jobs can be registered
    /// unconditionally. A job whose name is already registered replaces the
    /// earlier one in place.
    pub fn register(&mut self, job: Option<Arc<dyn CronJob>>) -> &mut Self {
        let Some(job) = job else {
            return self;
        };
        match self.jobs.iter_mut().find(|j| j.name() == job.name()) {
            Some(slot) => {
                warn!(job = job.name(), "cron job registered twice; replacing");
                *slot = job;
            }
            None => self.jobs.push(job),
        }
        self
    }

    /// Snapshot of the registered jobs.
    pub fn jobs(&self) -> Vec<Arc<dyn CronJob>> {
        self.jobs.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl CronJob for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _ctx: &CancellationToken) -> ServiceResult<()> {
            Ok(())
        }
    }

    fn job(name: &'static str) -> Option<Arc<dyn CronJob>> {
        Some(Arc::new(Named(name)))
    }

    #[test]
    fn register_preserves_order_and_ignores_none() {
        let mut registry = Registry::new();
        registry.register(job("b")).register(None).register(job("a"));
        assert_eq!(registry.names(), vec!["b", "a"]);
    }

    #[test]
    fn duplicate_name_replaces_in_place() {
        let mut registry = Registry::new();
        registry.register(job("a")).register(job("b")).register(job("a"));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn jobs_returns_an_independent_copy() {
        let mut registry = Registry::new();
        registry.register(job("a"));
        let mut copy = registry.jobs();
        copy.clear();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ensure_live_reports_cancellation() {
        let ctx = CancellationToken::new();
        assert!(ensure_live(&ctx).is_ok());
        ctx.cancel();
        assert_eq!(ensure_live(&ctx), Err(ServiceError::Cancelled));
    }
}
