//! Closed tag sets persisted in the outbox.
//!
//! The string forms are part of the storage contract and must not change.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored tag did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} tag: {value}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LicenseExpiringSoon,
    LicenseExpired,
    LicenseStatusChanged,
    OrderPendingNudge,
    OrderExpired,
    SubscriptionStatusChanged,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::LicenseExpiringSoon,
        EventType::LicenseExpired,
        EventType::LicenseStatusChanged,
        EventType::OrderPendingNudge,
        EventType::OrderExpired,
        EventType::SubscriptionStatusChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LicenseExpiringSoon => "license_expiring_soon",
            EventType::LicenseExpired => "license_expired",
            EventType::LicenseStatusChanged => "license_status_changed",
            EventType::OrderPendingNudge => "order_pending_nudge",
            EventType::OrderExpired => "order_expired",
            EventType::SubscriptionStatusChanged => "subscription_status_changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTag {
                kind: "event_type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    License,
    VendorOrder,
    Store,
    Subscription,
}

impl AggregateType {
    pub const ALL: [AggregateType; 4] = [
        AggregateType::License,
        AggregateType::VendorOrder,
        AggregateType::Store,
        AggregateType::Subscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::License => "license",
            AggregateType::VendorOrder => "vendor_order",
            AggregateType::Store => "store",
            AggregateType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AggregateType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTag {
                kind: "aggregate_type",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_and_as_str_agree() {
        for t in EventType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        for t in AggregateType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<AggregateType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let err = "LicenseExpired".parse::<EventType>().unwrap_err();
        assert_eq!(err.kind, "event_type");
        assert!("orders".parse::<AggregateType>().is_err());
    }
}
