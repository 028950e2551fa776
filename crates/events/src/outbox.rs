//! Outbox rows.
//!
//! An [`OutboxEvent`] is written in the same transaction as the business
//! change it describes. A separate publisher reads the table, bumps
//! `attempt_count`, and either stamps `published_at` or moves the row to the
//! dead-letter table as an [`OutboxDlqEntry`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use bazaar_core::AggregateId;

use crate::event::Event;
use crate::taxonomy::{AggregateType, EventType, UnknownTag};

#[derive(Debug, Error)]
#[error("outbox payload serialization failed: {0}")]
pub struct OutboxEncodeError(#[from] serde_json::Error);

/// An event about to be appended to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    /// Build an outbox row from a typed domain event.
    ///
    /// The payload is the event's JSON serialization; the taxonomy columns are
    /// read from the [`Event`] impl so they can never disagree with the body.
    pub fn from_typed<E: Event>(event: &E) -> Result<Self, OutboxEncodeError> {
        Ok(Self {
            id: Uuid::now_v7(),
            event_type: event.event_type(),
            aggregate_type: event.aggregate_type(),
            aggregate_id: event.aggregate_id(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload: serde_json::to_vec(event)?,
        })
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Row state right after insertion: unpublished, zero attempts.
    pub fn from_new(event: NewOutboxEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_version: event.event_version,
            occurred_at: event.occurred_at,
            payload: event.payload,
            created_at,
            published_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Decode the JSON payload into a typed event body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Why an event ended up in the dead-letter table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxAttempts,
    NonRetryable,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::MaxAttempts => "max_attempts",
            DlqReason::NonRetryable => "non_retryable",
        }
    }
}

impl core::str::FromStr for DlqReason {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_attempts" => Ok(DlqReason::MaxAttempts),
            "non_retryable" => Ok(DlqReason::NonRetryable),
            other => Err(UnknownTag {
                kind: "error_reason",
                value: other.to_string(),
            }),
        }
    }
}

/// Terminal dead-letter row. Never re-emitted automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxDlqEntry {
    pub id: Uuid,
    /// Identifier of the original outbox event.
    pub event_id: Uuid,
    pub event_type: EventType,
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
    pub payload: Vec<u8>,
    pub error_reason: DlqReason,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxDlqEntry {
    pub fn from_event(
        event: OutboxEvent,
        reason: DlqReason,
        message: Option<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: event.id,
            event_type: event.event_type,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            payload: event.payload,
            error_reason: reason,
            error_message: message.or(event.last_error),
            attempt_count: event.attempt_count,
            failed_at,
            created_at: event.created_at,
        }
    }
}
