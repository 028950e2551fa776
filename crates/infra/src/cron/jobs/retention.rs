//! Age-based purges of notifications and delivered outbox rows.

use async_trait::async_trait;
use bazaar_core::{Clock, days};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{NotificationsConfig, OutboxConfig};
use crate::cron::{CronJob, ensure_live};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::Repositories;

pub const NOTIFICATION_RETENTION_JOB: &str = "notification_retention";
pub const OUTBOX_RETENTION_JOB: &str = "outbox_retention";

pub struct NotificationRetentionJob<Tx> {
    repos: Repositories<Tx>,
    clock: Clock,
    retention_days: u32,
}

impl<Tx: Send + 'static> NotificationRetentionJob<Tx> {
    pub fn new(repos: Repositories<Tx>, settings: &NotificationsConfig, clock: Clock) -> Self {
        Self {
            repos,
            clock,
            retention_days: settings.retention_days,
        }
    }
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for NotificationRetentionJob<Tx> {
    fn name(&self) -> &str {
        NOTIFICATION_RETENTION_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        ensure_live(ctx)?;
        let cutoff = self.clock.now() - days(self.retention_days);
        info!(job = NOTIFICATION_RETENTION_JOB, %cutoff, "starting");

        let notifications = self.repos.notifications.clone();
        let deleted = self
            .repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move { notifications.delete_created_before(tx, cutoff).await })
            })
            .await?;

        info!(job = NOTIFICATION_RETENTION_JOB, deleted, "finished");
        Ok(())
    }
}

/// Deletes published outbox rows past retention. Rows still below
/// `min_attempts` are never touched.
pub struct OutboxRetentionJob<Tx> {
    repos: Repositories<Tx>,
    clock: Clock,
    retention_days: u32,
    min_attempts: u32,
}

impl<Tx: Send + 'static> OutboxRetentionJob<Tx> {
    pub fn new(repos: Repositories<Tx>, settings: &OutboxConfig, clock: Clock) -> Self {
        Self {
            repos,
            clock,
            retention_days: settings.retention_days,
            min_attempts: settings.min_attempts,
        }
    }
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for OutboxRetentionJob<Tx> {
    fn name(&self) -> &str {
        OUTBOX_RETENTION_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        ensure_live(ctx)?;
        let cutoff = self.clock.now() - days(self.retention_days);
        let min_attempts = self.min_attempts;
        info!(job = OUTBOX_RETENTION_JOB, %cutoff, min_attempts, "starting");

        let outbox = self.repos.outbox.clone();
        let deleted = self
            .repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    let deleted = outbox.delete_published_before(tx, cutoff, min_attempts).await?;
                    Ok::<_, ServiceError>(deleted)
                })
            })
            .await?;

        info!(job = OUTBOX_RETENTION_JOB, deleted, "finished");
        Ok(())
    }
}
