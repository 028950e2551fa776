use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use bazaar_core::{LicenseId, MediaId, StoreId};
use bazaar_licensing::{KycStatus, License, LicenseStatus, Store};

use super::{PgTx, PostgresStore, map_sqlx_error, parse_tag};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::{LicensesRepository, StoreRepository};

const LICENSE_COLUMNS: &str = "id, store_id, status, expiration_date, media_id, storage_key";

fn license_from_row(row: &PgRow) -> ServiceResult<License> {
    let status: String = row.try_get("status")?;
    let media_id: Option<Uuid> = row.try_get("media_id")?;
    Ok(License {
        id: LicenseId::from_uuid(row.try_get("id")?),
        store_id: StoreId::from_uuid(row.try_get("store_id")?),
        status: parse_tag::<LicenseStatus>("licenses.status", &status)?,
        expiration_date: row.try_get("expiration_date")?,
        media_id: media_id.map(MediaId::from_uuid),
        storage_key: row.try_get("storage_key")?,
    })
}

impl PostgresStore {
    async fn fetch_licenses(
        &self,
        operation: &str,
        filter: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> ServiceResult<Vec<License>> {
        let sql = format!(
            "SELECT {LICENSE_COLUMNS} FROM licenses WHERE {filter} ORDER BY expiration_date ASC, id ASC"
        );
        let mut query = sqlx::query(&sql).bind(from);
        if let Some(to) = to {
            query = query.bind(to);
        }
        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(license_from_row).collect()
    }
}

#[async_trait]
impl LicensesRepository<PgTx> for PostgresStore {
    async fn find_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>> {
        self.fetch_licenses(
            "find_expiring_between",
            "expiration_date >= $1 AND expiration_date < $2 AND status <> 'expired'",
            from,
            Some(to),
        )
        .await
    }

    async fn find_expired_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>> {
        self.fetch_licenses(
            "find_expired_in_range",
            "expiration_date >= $1 AND expiration_date < $2 AND status = 'verified'",
            from,
            Some(to),
        )
        .await
    }

    async fn find_expired_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<License>> {
        self.fetch_licenses(
            "find_expired_before",
            "expiration_date <= $1 AND status = 'expired'",
            cutoff,
            None,
        )
        .await
    }

    async fn update_status(
        &self,
        tx: &mut PgTx,
        id: LicenseId,
        status: LicenseStatus,
    ) -> ServiceResult<()> {
        let result = sqlx::query("UPDATE licenses SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("license_update_status", e))?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("license {id}")));
        }
        Ok(())
    }

    async fn list_statuses(
        &self,
        tx: &mut PgTx,
        store_id: StoreId,
    ) -> ServiceResult<Vec<LicenseStatus>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT status FROM licenses WHERE store_id = $1")
            .bind(store_id.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("license_list_statuses", e))?;
        raw.iter()
            .map(|s| parse_tag::<LicenseStatus>("licenses.status", s))
            .collect()
    }

    async fn delete(&self, tx: &mut PgTx, id: LicenseId) -> ServiceResult<()> {
        sqlx::query("DELETE FROM licenses WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("license_delete", e))?;
        Ok(())
    }
}

fn store_from_row(row: &PgRow) -> ServiceResult<Store> {
    let kyc: String = row.try_get("kyc_status")?;
    Ok(Store {
        id: StoreId::from_uuid(row.try_get("id")?),
        kyc_status: parse_tag::<KycStatus>("stores.kyc_status", &kyc)?,
        subscription_active: row.try_get("subscription_active")?,
    })
}

fn ensure_store_touched(rows: u64, id: StoreId) -> ServiceResult<()> {
    if rows == 0 {
        return Err(ServiceError::not_found(format!("store {id}")));
    }
    Ok(())
}

#[async_trait]
impl StoreRepository<PgTx> for PostgresStore {
    async fn update_status(
        &self,
        tx: &mut PgTx,
        id: StoreId,
        status: KycStatus,
    ) -> ServiceResult<()> {
        let result = sqlx::query("UPDATE stores SET kyc_status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("store_update_status", e))?;
        ensure_store_touched(result.rows_affected(), id)
    }

    async fn find_by_id(&self, tx: &mut PgTx, id: StoreId) -> ServiceResult<Store> {
        let row = sqlx::query("SELECT id, kyc_status, subscription_active FROM stores WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("store_find_by_id", e))?
            .ok_or_else(|| ServiceError::not_found(format!("store {id}")))?;
        store_from_row(&row)
    }

    async fn update(&self, tx: &mut PgTx, store: &Store) -> ServiceResult<()> {
        let result = sqlx::query(
            "UPDATE stores SET kyc_status = $2, subscription_active = $3 WHERE id = $1",
        )
        .bind(store.id.as_uuid())
        .bind(store.kyc_status.as_str())
        .bind(store.subscription_active)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("store_update", e))?;
        ensure_store_touched(result.rows_affected(), store.id)
    }

    async fn update_subscription_active(
        &self,
        tx: &mut PgTx,
        id: StoreId,
        active: bool,
    ) -> ServiceResult<()> {
        let result = sqlx::query("UPDATE stores SET subscription_active = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(active)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("store_update_subscription_active", e))?;
        ensure_store_touched(result.rows_affected(), id)
    }
}
