//! Store subscriptions and their reconciliation against the billing provider.
//!
//! Everything here is deterministic: the provider is reached only through the
//! [`BillingProvider`] trait, and the sync rules are pure functions over a
//! local [`Subscription`] and a [`ProviderSubscription`] snapshot.

pub mod events;
pub mod provider;
pub mod subscription;
pub mod sync;

pub use events::SubscriptionStatusChanged;
pub use provider::{
    ActionKind, BillingProvider, CreateSubscriptionParams, PauseParams, ProviderAction,
    ProviderError, ProviderItem, ProviderSubscription, ResumeParams, format_provider_date,
    parse_provider_date, provider_date_start,
};
pub use subscription::{Subscription, SubscriptionStatus};
pub use sync::{
    apply_pending_actions, derive_entitlement_active, is_active_status, map_provider_status,
    pause_effective_date, update_subscription_from_provider,
};
