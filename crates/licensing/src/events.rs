//! License lifecycle events persisted to the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{AggregateId, LicenseId, StoreId};
use bazaar_events::{AggregateType, Event, EventType};

use crate::store::KycStatus;

/// A verified license expires in `days_until_expiry` days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseExpiringSoon {
    pub license_id: LicenseId,
    pub store_id: StoreId,
    pub expiration_date: DateTime<Utc>,
    pub days_until_expiry: u32,
    pub occurred_at: DateTime<Utc>,
}

impl Event for LicenseExpiringSoon {
    fn event_type(&self) -> EventType {
        EventType::LicenseExpiringSoon
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::License
    }

    fn aggregate_id(&self) -> AggregateId {
        self.license_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A license moved from verified to expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseExpired {
    pub license_id: LicenseId,
    pub store_id: StoreId,
    pub expiration_date: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl Event for LicenseExpired {
    fn event_type(&self) -> EventType {
        EventType::LicenseExpired
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::License
    }

    fn aggregate_id(&self) -> AggregateId {
        self.license_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.expired_at
    }
}

/// A license transition changed the owning store's KYC status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStatusChanged {
    pub store_id: StoreId,
    pub license_id: LicenseId,
    pub previous_status: KycStatus,
    pub new_status: KycStatus,
    pub changed_at: DateTime<Utc>,
}

impl Event for LicenseStatusChanged {
    fn event_type(&self) -> EventType {
        EventType::LicenseStatusChanged
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Store
    }

    fn aggregate_id(&self) -> AggregateId {
        self.store_id.into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.changed_at
    }
}
