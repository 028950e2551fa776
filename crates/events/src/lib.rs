//! Domain event taxonomy and the outbox record shapes.
//!
//! The concrete payloads live next to the domain they describe
//! (`bazaar-licensing`, `bazaar-orders`, `bazaar-billing`); this crate only
//! owns the closed tag sets, the `Event` contract and the persisted rows.

pub mod event;
pub mod outbox;
pub mod taxonomy;

pub use event::Event;
pub use outbox::{DlqReason, NewOutboxEvent, OutboxDlqEntry, OutboxEncodeError, OutboxEvent};
pub use taxonomy::{AggregateType, EventType, UnknownTag};
