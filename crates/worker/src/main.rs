use std::sync::Arc;

use anyhow::Context;
use bazaar_core::Clock;
use bazaar_infra::config::ConfigLoader;
use bazaar_infra::cron::jobs::{
    LicenseLifecycleJob, NotificationRetentionJob, OrderTtlJob, OutboxRetentionJob,
    PendingMediaCleanupJob, SubscriptionReconcileJob,
};
use bazaar_infra::cron::{CronJob, Registry, Scheduler};
use bazaar_infra::db::{PgTx, PostgresStore};
use bazaar_infra::external::SquareBillingProvider;
use bazaar_infra::redis::RedisLockKv;
use bazaar_infra::{DistributedLock, Repositories, SubscriptionService};
use bazaar_observability::CronMetricsRegistry;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bazaar_observability::init();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    let database_url = config
        .database_url
        .as_deref()
        .context("database_url is not configured")?;
    let redis_url = config
        .redis_url
        .as_deref()
        .context("redis_url is not configured")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("connecting to postgres")?;
    let store = PostgresStore::new(pool);
    store.run_migrations().await.context("running migrations")?;
    let repos: Repositories<PgTx> = Repositories::from_store(Arc::new(store));

    let kv = RedisLockKv::connect(redis_url)
        .await
        .context("connecting to redis")?;
    let lock = DistributedLock::new(Arc::new(kv), config.cron.lock_key.clone(), config.cron.lock_ttl);

    let clock = Clock::system();
    let reconcile: Option<Arc<dyn CronJob>> = match config.square_config() {
        Some(square) => {
            let provider = Arc::new(SquareBillingProvider::new(square));
            let service = SubscriptionService::new(
                repos.clone(),
                provider,
                config.subscriptions.default_price_id.clone(),
                clock.clone(),
            )
            .with_location(config.square.location_id.clone());
            Some(Arc::new(SubscriptionReconcileJob::new(
                repos.clone(),
                Arc::new(service),
                &config.subscriptions,
                clock.clone(),
            )))
        }
        None => {
            tracing::warn!("square access token not set; subscription reconcile disabled");
            None
        }
    };

    let mut registry = Registry::new();
    registry
        .register(Some(Arc::new(LicenseLifecycleJob::new(
            repos.clone(),
            config.license.clone(),
            clock.clone(),
        ))))
        .register(Some(Arc::new(OrderTtlJob::new(
            repos.clone(),
            config.orders.clone(),
            clock.clone(),
        ))))
        .register(Some(Arc::new(NotificationRetentionJob::new(
            repos.clone(),
            &config.notifications,
            clock.clone(),
        ))))
        .register(Some(Arc::new(OutboxRetentionJob::new(
            repos.clone(),
            &config.outbox,
            clock.clone(),
        ))))
        .register(Some(Arc::new(PendingMediaCleanupJob::new(
            repos,
            &config.media,
            clock,
        ))))
        .register(reconcile);

    let scheduler = Scheduler::new(
        registry,
        Arc::new(lock),
        Arc::new(CronMetricsRegistry::new()),
        config.cron.interval,
    );

    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    tracing::info!(interval = ?scheduler.interval(), "cron worker started");
    match scheduler.run(ctx).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_cancelled() => {
            tracing::info!("cron worker stopped");
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err)).context("scheduler stopped"),
    }
}
