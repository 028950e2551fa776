use async_trait::async_trait;
use bazaar_core::{Clock, days};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MediaConfig;
use crate::cron::{CronJob, ensure_live};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::Repositories;

pub const PENDING_MEDIA_CLEANUP_JOB: &str = "pending_media_cleanup";

/// Drops uploads that never completed, together with their attachments.
pub struct PendingMediaCleanupJob<Tx> {
    repos: Repositories<Tx>,
    clock: Clock,
    retention_days: u32,
}

impl<Tx: Send + 'static> PendingMediaCleanupJob<Tx> {
    pub fn new(repos: Repositories<Tx>, settings: &MediaConfig, clock: Clock) -> Self {
        Self {
            repos,
            clock,
            retention_days: settings.pending_retention_days,
        }
    }
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for PendingMediaCleanupJob<Tx> {
    fn name(&self) -> &str {
        PENDING_MEDIA_CLEANUP_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        ensure_live(ctx)?;
        let cutoff = self.clock.now() - days(self.retention_days);
        info!(job = PENDING_MEDIA_CLEANUP_JOB, %cutoff, "starting");

        let candidates = self.repos.media.list_pending_before(cutoff).await?;
        if candidates.is_empty() {
            info!(job = PENDING_MEDIA_CLEANUP_JOB, candidates = 0, "finished");
            return Ok(());
        }
        ensure_live(ctx)?;

        let total = candidates.len();
        let repos = self.repos.clone();
        let (attachments_deleted, media_deleted) = self
            .repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    let mut attachments_deleted = 0u64;
                    let mut media_deleted = 0u64;
                    for media in &candidates {
                        attachments_deleted +=
                            repos.attachments.delete_by_media_id(tx, media.id).await?;
                        repos.media.delete(tx, media.id).await?;
                        media_deleted += 1;
                    }
                    Ok::<_, ServiceError>((attachments_deleted, media_deleted))
                })
            })
            .await?;

        info!(
            job = PENDING_MEDIA_CLEANUP_JOB,
            candidates = total,
            attachments_deleted,
            media_deleted,
            "finished"
        );
        Ok(())
    }
}
