//! On-demand subscription lifecycle against the billing provider.

#[cfg(test)]
pub(crate) mod fake;
pub mod service;

pub use service::{CreateSubscriptionInput, SubscriptionService};
