//! Transactional outbox store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use bazaar_core::AggregateId;
use bazaar_events::{
    AggregateType, DlqReason, Event, EventType, NewOutboxEvent, OutboxDlqEntry, OutboxEvent,
};

use crate::error::ServiceResult;

/// Append-only log of domain events plus its dead-letter table.
///
/// Writers (this crate) only append and purge; the external publisher uses
/// the reader-side methods to track delivery.
#[async_trait]
pub trait OutboxStore<Tx: Send>: Send + Sync {
    /// Insert a new row with `attempt_count = 0` and no `published_at`.
    async fn emit(&self, tx: &mut Tx, event: NewOutboxEvent) -> ServiceResult<OutboxEvent>;

    /// Whether any event of this type was ever recorded for the aggregate.
    async fn exists(
        &self,
        event_type: EventType,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<bool>;

    /// Delete rows published before `cutoff` with at least `min_attempts`
    /// delivery attempts. Returns the number of rows removed.
    async fn delete_published_before(
        &self,
        tx: &mut Tx,
        cutoff: DateTime<Utc>,
        min_attempts: u32,
    ) -> ServiceResult<u64>;

    /// Move a live event to the DLQ, keeping its id as `event_id`.
    async fn move_to_dlq(
        &self,
        tx: &mut Tx,
        event_id: Uuid,
        reason: DlqReason,
        message: Option<String>,
        failed_at: DateTime<Utc>,
    ) -> ServiceResult<OutboxDlqEntry>;

    /// Live events for one aggregate, oldest first.
    async fn list_for_aggregate(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, tx: &mut Tx, id: Uuid, at: DateTime<Utc>)
    -> ServiceResult<()>;

    /// Bump `attempt_count` and remember the last delivery error.
    async fn record_failure(&self, tx: &mut Tx, id: Uuid, error: &str) -> ServiceResult<()>;
}

/// Serialize a typed event and append it inside `tx`.
pub async fn emit_event<Tx, E>(
    outbox: &dyn OutboxStore<Tx>,
    tx: &mut Tx,
    event: &E,
) -> ServiceResult<OutboxEvent>
where
    Tx: Send,
    E: Event,
{
    let row = NewOutboxEvent::from_typed(event)?;
    outbox.emit(tx, row).await
}
