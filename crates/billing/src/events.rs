//! Subscription events persisted to the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{AggregateId, StoreId, SubscriptionId};
use bazaar_events::{AggregateType, Event, EventType};

use crate::subscription::SubscriptionStatus;

/// The local subscription status changed during a write or a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusChanged {
    pub subscription_id: SubscriptionId,
    pub store_id: StoreId,
    pub external_subscription_id: String,
    pub previous_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub entitlement_active: bool,
    pub changed_at: DateTime<Utc>,
}

impl Event for SubscriptionStatusChanged {
    fn event_type(&self) -> EventType {
        EventType::SubscriptionStatusChanged
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Subscription
    }

    fn aggregate_id(&self) -> AggregateId {
        self.subscription_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.changed_at
    }
}
