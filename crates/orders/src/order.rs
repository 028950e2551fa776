use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{
    CheckoutGroupId, DomainError, DomainResult, LineItemId, OrderId, ProductId, StoreId,
};

/// Vendor order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorOrderStatus {
    /// Placed by the buyer, awaiting the vendor's decision.
    CreatedPending,
    Accepted,
    Rejected,
    Fulfilled,
    Canceled,
    Expired,
}

impl VendorOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorOrderStatus::CreatedPending => "created_pending",
            VendorOrderStatus::Accepted => "accepted",
            VendorOrderStatus::Rejected => "rejected",
            VendorOrderStatus::Fulfilled => "fulfilled",
            VendorOrderStatus::Canceled => "canceled",
            VendorOrderStatus::Expired => "expired",
        }
    }
}

impl core::str::FromStr for VendorOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_pending" => Ok(VendorOrderStatus::CreatedPending),
            "accepted" => Ok(VendorOrderStatus::Accepted),
            "rejected" => Ok(VendorOrderStatus::Rejected),
            "fulfilled" => Ok(VendorOrderStatus::Fulfilled),
            "canceled" => Ok(VendorOrderStatus::Canceled),
            "expired" => Ok(VendorOrderStatus::Expired),
            other => Err(DomainError::unknown_tag("order status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemStatus {
    Pending,
    Accepted,
    Fulfilled,
    Rejected,
}

impl LineItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemStatus::Pending => "pending",
            LineItemStatus::Accepted => "accepted",
            LineItemStatus::Fulfilled => "fulfilled",
            LineItemStatus::Rejected => "rejected",
        }
    }

    /// Fulfilled and rejected lines hold no inventory reservation.
    pub fn is_settled(&self) -> bool {
        matches!(self, LineItemStatus::Fulfilled | LineItemStatus::Rejected)
    }
}

impl core::str::FromStr for LineItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LineItemStatus::Pending),
            "accepted" => Ok(LineItemStatus::Accepted),
            "fulfilled" => Ok(LineItemStatus::Fulfilled),
            "rejected" => Ok(LineItemStatus::Rejected),
            other => Err(DomainError::unknown_tag("line item status", other)),
        }
    }
}

/// Order line: product and reserved quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub status: LineItemStatus,
}

/// Inventory that has to be handed back when a line is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedReservation {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// One vendor's share of a buyer checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorOrder {
    pub id: OrderId,
    pub checkout_group_id: CheckoutGroupId,
    pub buyer_store_id: StoreId,
    pub vendor_store_id: StoreId,
    pub status: VendorOrderStatus,
    /// Outstanding amount in the smallest currency unit (e.g., cents).
    pub balance_due_cents: i64,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub line_items: Vec<LineItem>,
}

impl VendorOrder {
    pub fn is_pending(&self) -> bool {
        self.status == VendorOrderStatus::CreatedPending
    }

    /// Expire a still-pending order.
    ///
    /// Every unsettled line is rejected and its reservation returned to the
    /// caller for release; the order drops its balance and records `now`.
    /// Fails with a conflict if the order already left `created_pending`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> DomainResult<Vec<ReleasedReservation>> {
        if !self.is_pending() {
            return Err(DomainError::illegal_state(format!(
                "order {} is {}, not created_pending",
                self.id,
                self.status.as_str()
            )));
        }

        let mut released = Vec::new();
        for line in self.line_items.iter_mut().filter(|l| !l.status.is_settled()) {
            released.push(ReleasedReservation {
                product_id: line.product_id,
                quantity: line.quantity,
            });
            line.status = LineItemStatus::Rejected;
        }

        self.status = VendorOrderStatus::Expired;
        self.balance_due_cents = 0;
        self.expired_at = Some(now);
        Ok(released)
    }
}
