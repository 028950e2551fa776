use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bazaar_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SubscriptionsConfig;
use crate::cron::{CronJob, ensure_live};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::Repositories;
use crate::subscriptions::SubscriptionService;

pub const SUBSCRIPTION_RECONCILE_JOB: &str = "subscription_reconcile";

/// Periodically pulls provider state for a bounded set of subscriptions.
pub struct SubscriptionReconcileJob<Tx> {
    repos: Repositories<Tx>,
    service: Arc<SubscriptionService<Tx>>,
    clock: Clock,
    limit: usize,
    lookback: Duration,
}

impl<Tx: Send + 'static> SubscriptionReconcileJob<Tx> {
    pub fn new(
        repos: Repositories<Tx>,
        service: Arc<SubscriptionService<Tx>>,
        settings: &SubscriptionsConfig,
        clock: Clock,
    ) -> Self {
        Self {
            repos,
            service,
            clock,
            limit: settings.reconcile_limit as usize,
            lookback: settings.reconcile_lookback,
        }
    }
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for SubscriptionReconcileJob<Tx> {
    fn name(&self) -> &str {
        SUBSCRIPTION_RECONCILE_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        ensure_live(ctx)?;
        let lookback = chrono::Duration::from_std(self.lookback)
            .map_err(|err| ServiceError::validation(format!("reconcile lookback: {err}")))?;
        let since = self.clock.now() - lookback;
        info!(job = SUBSCRIPTION_RECONCILE_JOB, limit = self.limit, %since, "starting");

        let candidates = self
            .repos
            .billing
            .list_subscriptions_for_reconciliation(self.limit, since)
            .await?;

        let mut errors = Vec::new();
        let mut synced = 0usize;
        for sub in &candidates {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            match self.service.reconcile(&sub.external_subscription_id).await {
                Ok(_) => synced += 1,
                Err(err) => {
                    warn!(
                        subscription_id = %sub.id,
                        external_id = %sub.external_subscription_id,
                        error = %err,
                        "subscription reconcile failed"
                    );
                    errors.push(err);
                }
            }
        }

        info!(
            job = SUBSCRIPTION_RECONCILE_JOB,
            candidates = candidates.len(),
            synced,
            failed = errors.len(),
            "finished"
        );
        ServiceError::join(errors)
    }
}
