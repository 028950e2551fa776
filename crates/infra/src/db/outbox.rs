use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;
use uuid::Uuid;

use bazaar_core::AggregateId;
use bazaar_events::{
    AggregateType, DlqReason, EventType, NewOutboxEvent, OutboxDlqEntry, OutboxEvent,
};

use super::{PgTx, PostgresStore, map_sqlx_error, parse_tag, to_count};
use crate::error::{ServiceError, ServiceResult};
use crate::outbox::OutboxStore;

const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, event_version, \
     occurred_at, payload, created_at, published_at, attempt_count, last_error";

fn outbox_from_row(row: &PgRow) -> ServiceResult<OutboxEvent> {
    let event_type: String = row.try_get("event_type")?;
    let aggregate_type: String = row.try_get("aggregate_type")?;
    let aggregate_id: Uuid = row.try_get("aggregate_id")?;
    let event_version: i32 = row.try_get("event_version")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: parse_tag::<EventType>("event_type", &event_type)?,
        aggregate_type: parse_tag::<AggregateType>("aggregate_type", &aggregate_type)?,
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        event_version: to_count(event_version),
        occurred_at: row.try_get("occurred_at")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        attempt_count: to_count(attempt_count),
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl OutboxStore<PgTx> for PostgresStore {
    #[instrument(
        skip(self, tx, event),
        fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id),
        err
    )]
    async fn emit(&self, tx: &mut PgTx, event: NewOutboxEvent) -> ServiceResult<OutboxEvent> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO outbox_events (
                id, event_type, aggregate_type, aggregate_id, event_version, occurred_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(event.aggregate_type.as_str())
        .bind(event.aggregate_id.as_uuid())
        .bind(i32::try_from(event.event_version).unwrap_or(i32::MAX))
        .bind(event.occurred_at)
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_emit", e))?;
        outbox_from_row(&row)
    }

    async fn exists(
        &self,
        event_type: EventType,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM outbox_events
                WHERE event_type = $1 AND aggregate_type = $2 AND aggregate_id = $3
            ) OR EXISTS (
                SELECT 1 FROM outbox_dlq
                WHERE event_type = $1 AND aggregate_type = $2 AND aggregate_id = $3
            )
            "#,
        )
        .bind(event_type.as_str())
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_sqlx_error("outbox_exists", e))?;
        Ok(found)
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_published_before(
        &self,
        tx: &mut PgTx,
        cutoff: DateTime<Utc>,
        min_attempts: u32,
    ) -> ServiceResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE published_at IS NOT NULL
              AND published_at < $1
              AND attempt_count >= $2
            "#,
        )
        .bind(cutoff)
        .bind(i32::try_from(min_attempts).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_delete_published_before", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx, message), err)]
    async fn move_to_dlq(
        &self,
        tx: &mut PgTx,
        event_id: Uuid,
        reason: DlqReason,
        message: Option<String>,
        failed_at: DateTime<Utc>,
    ) -> ServiceResult<OutboxDlqEntry> {
        let row = sqlx::query(&format!(
            "DELETE FROM outbox_events WHERE id = $1 RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_dlq_take", e))?
        .ok_or_else(|| ServiceError::not_found(format!("outbox event {event_id}")))?;

        let entry = OutboxDlqEntry::from_event(outbox_from_row(&row)?, reason, message, failed_at);

        sqlx::query(
            r#"
            INSERT INTO outbox_dlq (
                id, event_id, event_type, aggregate_type, aggregate_id, payload,
                error_reason, error_message, attempt_count, failed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_id)
        .bind(entry.event_type.as_str())
        .bind(entry.aggregate_type.as_str())
        .bind(entry.aggregate_id.as_uuid())
        .bind(&entry.payload)
        .bind(entry.error_reason.as_str())
        .bind(entry.error_message.as_deref())
        .bind(i32::try_from(entry.attempt_count).unwrap_or(i32::MAX))
        .bind(entry.failed_at)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_dlq_insert", e))?;

        Ok(entry)
    }

    async fn list_for_aggregate(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox_events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("outbox_list_for_aggregate", e))?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, tx: &mut PgTx, id: Uuid, at: DateTime<Utc>) -> ServiceResult<()> {
        sqlx::query(
            "UPDATE outbox_events SET published_at = COALESCE(published_at, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_mark_published", e))?;
        Ok(())
    }

    async fn record_failure(&self, tx: &mut PgTx, id: Uuid, error: &str) -> ServiceResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempt_count = attempt_count + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("outbox_record_failure", e))?;
        Ok(())
    }
}
