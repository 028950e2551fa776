//! Vendor order events persisted to the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{AggregateId, CheckoutGroupId, OrderId, StoreId};
use bazaar_events::{AggregateType, Event, EventType};

/// Reminder that an order has waited `pending_days` for the vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPendingNudge {
    pub order_id: OrderId,
    pub checkout_group_id: CheckoutGroupId,
    pub buyer_store_id: StoreId,
    pub vendor_store_id: StoreId,
    pub pending_days: u32,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderPendingNudge {
    fn event_type(&self) -> EventType {
        EventType::OrderPendingNudge
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::VendorOrder
    }

    fn aggregate_id(&self) -> AggregateId {
        self.order_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// The vendor never answered; the order expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExpired {
    pub order_id: OrderId,
    pub checkout_group_id: CheckoutGroupId,
    pub buyer_store_id: StoreId,
    pub vendor_store_id: StoreId,
    pub expired_at: DateTime<Utc>,
}

impl Event for OrderExpired {
    fn event_type(&self) -> EventType {
        EventType::OrderExpired
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::VendorOrder
    }

    fn aggregate_id(&self) -> AggregateId {
        self.order_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.expired_at
    }
}
