use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, Row};

use bazaar_billing::{Subscription, SubscriptionStatus};
use bazaar_core::{StoreId, SubscriptionId};

use super::{PgTx, PostgresStore, map_sqlx_error, parse_tag};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::BillingRepository;

const SUBSCRIPTION_COLUMNS: &str = "id, store_id, external_subscription_id, status, price_id, \
     current_period_start, current_period_end, cancel_at_period_end, canceled_at, paused_at, \
     pause_effective_at, metadata, created_at";

fn subscription_from_row(row: &PgRow) -> ServiceResult<Subscription> {
    let status: String = row.try_get("status")?;
    let Json(metadata): Json<BTreeMap<String, String>> = row.try_get("metadata")?;
    Ok(Subscription {
        id: SubscriptionId::from_uuid(row.try_get("id")?),
        store_id: StoreId::from_uuid(row.try_get("store_id")?),
        external_subscription_id: row.try_get("external_subscription_id")?,
        status: parse_tag::<SubscriptionStatus>("subscriptions.status", &status)?,
        price_id: row.try_get("price_id")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        canceled_at: row.try_get("canceled_at")?,
        paused_at: row.try_get("paused_at")?,
        pause_effective_at: row.try_get("pause_effective_at")?,
        metadata,
        created_at: row.try_get("created_at")?,
    })
}

impl PostgresStore {
    async fn fetch_subscription<'e, E>(
        executor: E,
        operation: &str,
        filter: &str,
        lock: bool,
        bind: SubscriptionKey<'_>,
    ) -> ServiceResult<Option<Subscription>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {filter} \
             ORDER BY created_at DESC LIMIT 1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let query = sqlx::query(&sql);
        let query = match bind {
            SubscriptionKey::Store(id) => query.bind(*id.as_uuid()),
            SubscriptionKey::External(ext) => query.bind(ext),
            SubscriptionKey::Id(id) => query.bind(*id.as_uuid()),
        };
        let row = query
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn write_subscription(
        tx: &mut PgTx,
        operation: &str,
        sql: &str,
        sub: &Subscription,
    ) -> ServiceResult<u64> {
        let result = sqlx::query(sql)
            .bind(sub.id.as_uuid())
            .bind(sub.store_id.as_uuid())
            .bind(&sub.external_subscription_id)
            .bind(sub.status.as_str())
            .bind(sub.price_id.as_deref())
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .bind(sub.cancel_at_period_end)
            .bind(sub.canceled_at)
            .bind(sub.paused_at)
            .bind(sub.pause_effective_at)
            .bind(Json(&sub.metadata))
            .bind(sub.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }
}

enum SubscriptionKey<'a> {
    Store(StoreId),
    External(&'a str),
    Id(SubscriptionId),
}

const BY_STORE: &str = "store_id = $1";
const ACTIVE_BY_STORE: &str = "store_id = $1 AND status <> 'canceled'";
const BY_EXTERNAL_ID: &str = "external_subscription_id = $1";
const BY_ID: &str = "id = $1";

#[async_trait]
impl BillingRepository<PgTx> for PostgresStore {
    async fn find_subscription(&self, store_id: StoreId) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            self.pool(),
            "subscription_find",
            BY_STORE,
            false,
            SubscriptionKey::Store(store_id),
        )
        .await
    }

    async fn find_active_subscription(
        &self,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            self.pool(),
            "subscription_find_active",
            ACTIVE_BY_STORE,
            false,
            SubscriptionKey::Store(store_id),
        )
        .await
    }

    async fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            self.pool(),
            "subscription_find_by_external_id",
            BY_EXTERNAL_ID,
            false,
            SubscriptionKey::External(external_id),
        )
        .await
    }

    async fn list_subscriptions_for_reconciliation(
        &self,
        limit: usize,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status <> 'canceled'
               OR canceled_at >= $1
               OR current_period_end >= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("subscriptions_for_reconciliation", e))?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn lock_active_for_store(
        &self,
        tx: &mut PgTx,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            &mut **tx,
            "subscription_lock_active",
            ACTIVE_BY_STORE,
            true,
            SubscriptionKey::Store(store_id),
        )
        .await
    }

    async fn lock_by_external_id(
        &self,
        tx: &mut PgTx,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            &mut **tx,
            "subscription_lock_by_external_id",
            BY_EXTERNAL_ID,
            true,
            SubscriptionKey::External(external_id),
        )
        .await
    }

    async fn lock_by_id(
        &self,
        tx: &mut PgTx,
        id: SubscriptionId,
    ) -> ServiceResult<Option<Subscription>> {
        Self::fetch_subscription(
            &mut **tx,
            "subscription_lock_by_id",
            BY_ID,
            true,
            SubscriptionKey::Id(id),
        )
        .await
    }

    async fn create_subscription(&self, tx: &mut PgTx, sub: &Subscription) -> ServiceResult<()> {
        Self::write_subscription(
            tx,
            "subscription_create",
            r#"
            INSERT INTO subscriptions (
                id, store_id, external_subscription_id, status, price_id,
                current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, paused_at, pause_effective_at, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
            sub,
        )
        .await?;
        Ok(())
    }

    async fn update_subscription(&self, tx: &mut PgTx, sub: &Subscription) -> ServiceResult<()> {
        let rows = Self::write_subscription(
            tx,
            "subscription_update",
            r#"
            UPDATE subscriptions
            SET store_id = $2,
                external_subscription_id = $3,
                status = $4,
                price_id = $5,
                current_period_start = $6,
                current_period_end = $7,
                cancel_at_period_end = $8,
                canceled_at = $9,
                paused_at = $10,
                pause_effective_at = $11,
                metadata = $12,
                created_at = $13
            WHERE id = $1
            "#,
            sub,
        )
        .await?;
        if rows == 0 {
            return Err(ServiceError::not_found(format!("subscription {}", sub.id)));
        }
        Ok(())
    }
}
