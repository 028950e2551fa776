use chrono::{DateTime, Utc};
use serde::Serialize;

use bazaar_core::AggregateId;

use crate::taxonomy::{AggregateType, EventType};

/// A domain event that can be persisted to the outbox.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - scoped to exactly one aggregate
///
/// The serialized form of the implementing type is the outbox payload, so
/// payload structs use camelCase field names.
pub trait Event: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Tag from the closed event taxonomy.
    fn event_type(&self) -> EventType;

    /// Tag of the aggregate this event describes.
    fn aggregate_type(&self) -> AggregateType;

    /// Identifier of the aggregate this event describes.
    fn aggregate_id(&self) -> AggregateId;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
