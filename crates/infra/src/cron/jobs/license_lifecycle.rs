use std::sync::Arc;

use async_trait::async_trait;
use bazaar_core::{Clock, LicenseId, StoreId, days, start_of_utc_day};
use bazaar_events::{AggregateType, EventType};
use bazaar_licensing::{
    License, LicenseExpired, LicenseExpiringSoon, LicenseStatus, LicenseStatusChanged,
    determine_store_kyc_status,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{LicenseConfig, MediaConfig};
use crate::cron::{CronJob, ensure_live};
use crate::error::{ServiceError, ServiceResult};
use crate::external::ObjectStorageClient;
use crate::outbox::emit_event;
use crate::repositories::Repositories;

pub const LICENSE_LIFECYCLE_JOB: &str = "license_lifecycle";

/// Warns about licenses nearing expiry, expires lapsed ones, and purges
/// licenses that have been expired long enough.
pub struct LicenseLifecycleJob<Tx> {
    repos: Repositories<Tx>,
    storage: Option<Arc<dyn ObjectStorageClient>>,
    bucket: String,
    clock: Clock,
    settings: LicenseConfig,
}

impl<Tx: Send + 'static> LicenseLifecycleJob<Tx> {
    pub fn new(repos: Repositories<Tx>, settings: LicenseConfig, clock: Clock) -> Self {
        Self {
            repos,
            storage: None,
            bucket: MediaConfig::default().bucket,
            clock,
            settings,
        }
    }

    /// Purge backing documents from `bucket` during hard delete.
    pub fn with_storage(
        mut self,
        storage: Arc<dyn ObjectStorageClient>,
        bucket: impl Into<String>,
    ) -> Self {
        self.storage = Some(storage);
        self.bucket = bucket.into();
        self
    }

    async fn warn_expiring(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        let now = self.clock.now();
        let warn_days = self.settings.expiry_warning_days;
        let day = start_of_utc_day(now + days(warn_days));
        let candidates = self
            .repos
            .licenses
            .find_expiring_between(day, day + days(1))
            .await?;

        let mut errors = Vec::new();
        let mut emitted = 0usize;
        for license in &candidates {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            let Some(expiration_date) = license.expiration_date.filter(|_| license.is_warnable())
            else {
                continue;
            };
            match self.warn_one(license, expiration_date, warn_days, now).await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(license_id = %license.id, error = %err, "expiry warning failed");
                    errors.push(err);
                }
            }
        }

        info!(candidates = candidates.len(), emitted, "license expiry warnings");
        ServiceError::join(errors)
    }

    async fn warn_one(
        &self,
        license: &License,
        expiration_date: DateTime<Utc>,
        warn_days: u32,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        let already_warned = self
            .repos
            .outbox
            .exists(
                EventType::LicenseExpiringSoon,
                AggregateType::License,
                license.id.into(),
            )
            .await?;
        if already_warned {
            return Ok(false);
        }

        let event = LicenseExpiringSoon {
            license_id: license.id,
            store_id: license.store_id,
            expiration_date,
            days_until_expiry: warn_days,
            occurred_at: now,
        };
        let outbox = Arc::clone(&self.repos.outbox);
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    emit_event(&*outbox, tx, &event).await?;
                    Ok::<_, ServiceError>(())
                })
            })
            .await?;
        Ok(true)
    }

    async fn expire_lapsed(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        let now = self.clock.now();
        let from = now - days(self.settings.expiration_window_days);
        let candidates = self.repos.licenses.find_expired_in_range(from, now).await?;

        let mut errors = Vec::new();
        let mut expired = 0usize;
        for license in candidates.iter().filter(|l| l.is_lapsed(now)) {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            match self.expire_one(license.clone(), now).await {
                Ok(()) => expired += 1,
                Err(err) => {
                    warn!(license_id = %license.id, error = %err, "license expiration failed");
                    errors.push(err);
                }
            }
        }

        info!(candidates = candidates.len(), expired, "licenses expired");
        ServiceError::join(errors)
    }

    async fn expire_one(&self, license: License, now: DateTime<Utc>) -> ServiceResult<()> {
        let repos = self.repos.clone();
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    repos
                        .licenses
                        .update_status(tx, license.id, LicenseStatus::Expired)
                        .await?;
                    sync_store_kyc(&repos, tx, license.store_id, license.id, now).await?;

                    let Some(expiration_date) = license.expiration_date else {
                        return Err(ServiceError::fatal(format!(
                            "license {} has no expiration date",
                            license.id
                        )));
                    };
                    let event = LicenseExpired {
                        license_id: license.id,
                        store_id: license.store_id,
                        expiration_date,
                        expired_at: now,
                    };
                    emit_event(&*repos.outbox, tx, &event).await?;
                    Ok::<_, ServiceError>(())
                })
            })
            .await
    }

    async fn hard_delete(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        let now = self.clock.now();
        let cutoff = now - days(self.settings.deletion_age_days);
        let candidates = self.repos.licenses.find_expired_before(cutoff).await?;

        let mut errors = Vec::new();
        let mut deleted = 0usize;
        for license in &candidates {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            match self.delete_one(license.clone(), now).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    warn!(license_id = %license.id, error = %err, "license hard delete failed");
                    errors.push(err);
                }
            }
        }

        info!(candidates = candidates.len(), deleted, "expired licenses purged");
        ServiceError::join(errors)
    }

    async fn delete_one(&self, license: License, now: DateTime<Utc>) -> ServiceResult<()> {
        let attachments = match license.media_id {
            Some(media_id) => self.repos.attachments.list_by_media_id(media_id).await?,
            None => Vec::new(),
        };
        let repos = self.repos.clone();
        let storage = self.storage.clone();
        let bucket = self.bucket.clone();

        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    for attachment in &attachments {
                        repos
                            .attachments
                            .delete(
                                tx,
                                &attachment.entity_type,
                                &attachment.entity_id,
                                attachment.media_id,
                            )
                            .await?;
                    }

                    if let (Some(storage), Some(key)) = (storage.as_ref(), license.object_key()) {
                        if let Err(err) = storage.delete_object(&bucket, key).await {
                            warn!(
                                license_id = %license.id,
                                bucket = %bucket,
                                key,
                                error = %err,
                                "object storage delete failed; continuing"
                            );
                        }
                    }

                    repos.licenses.delete(tx, license.id).await?;
                    if let Some(media_id) = license.media_id {
                        repos.media.delete(tx, media_id).await?;
                    }
                    sync_store_kyc(&repos, tx, license.store_id, license.id, now).await?;
                    Ok::<_, ServiceError>(())
                })
            })
            .await
    }
}

/// Recompute the store's KYC status from its remaining licenses, write it,
/// and emit a status-change event when it moved.
async fn sync_store_kyc<Tx: Send>(
    repos: &Repositories<Tx>,
    tx: &mut Tx,
    store_id: StoreId,
    license_id: LicenseId,
    now: DateTime<Utc>,
) -> ServiceResult<()> {
    let statuses = repos.licenses.list_statuses(tx, store_id).await?;
    let next = determine_store_kyc_status(&statuses);
    let store = repos.stores.find_by_id(tx, store_id).await?;
    repos.stores.update_status(tx, store_id, next).await?;

    if store.kyc_status != next {
        let event = LicenseStatusChanged {
            store_id,
            license_id,
            previous_status: store.kyc_status,
            new_status: next,
            changed_at: now,
        };
        emit_event(&*repos.outbox, tx, &event).await?;
    }
    Ok(())
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for LicenseLifecycleJob<Tx> {
    fn name(&self) -> &str {
        LICENSE_LIFECYCLE_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        info!(job = LICENSE_LIFECYCLE_JOB, "starting");
        let mut errors = Vec::new();

        if let Err(err) = self.warn_expiring(ctx).await {
            errors.push(err);
        }
        if ensure_live(ctx).is_ok() {
            if let Err(err) = self.expire_lapsed(ctx).await {
                errors.push(err);
            }
        }
        if ensure_live(ctx).is_ok() {
            if let Err(err) = self.hard_delete(ctx).await {
                errors.push(err);
            }
        }

        let failures = errors.len();
        info!(job = LICENSE_LIFECYCLE_JOB, failures, "finished");
        ServiceError::join(errors)
    }
}
