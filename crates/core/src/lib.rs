//! `bazaar-core`: shared domain building blocks.
//!
//! Typed identifiers, the domain error model and the injectable clock. No
//! infrastructure concerns live here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, days, start_of_utc_day};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, CheckoutGroupId, LicenseId, LineItemId, MediaId, OrderId, ProductId, StoreId,
    SubscriptionId,
};
