//! Vendor orders domain module.
//!
//! This crate contains the business rules for pending vendor orders that the
//! order-TTL job relies on, implemented as deterministic domain logic (no IO,
//! no HTTP, no storage).

pub mod events;
pub mod order;

pub use events::{OrderExpired, OrderPendingNudge};
pub use order::{LineItem, LineItemStatus, ReleasedReservation, VendorOrder, VendorOrderStatus};
