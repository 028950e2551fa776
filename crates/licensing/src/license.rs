use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{DomainError, LicenseId, MediaId, StoreId};

/// License verification lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Pending,
    Verified,
    Rejected,
    Expired,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Pending => "pending",
            LicenseStatus::Verified => "verified",
            LicenseStatus::Rejected => "rejected",
            LicenseStatus::Expired => "expired",
        }
    }
}

impl core::str::FromStr for LicenseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LicenseStatus::Pending),
            "verified" => Ok(LicenseStatus::Verified),
            "rejected" => Ok(LicenseStatus::Rejected),
            "expired" => Ok(LicenseStatus::Expired),
            other => Err(DomainError::unknown_tag("license status", other)),
        }
    }
}

/// The slice of a license row the lifecycle job works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: LicenseId,
    pub store_id: StoreId,
    pub status: LicenseStatus,
    pub expiration_date: Option<DateTime<Utc>>,
    /// Backing document, if one was uploaded.
    pub media_id: Option<MediaId>,
    /// Object-storage key of the backing document (may be empty).
    pub storage_key: Option<String>,
}

impl License {
    /// Eligible for an "expiring soon" reminder.
    pub fn is_warnable(&self) -> bool {
        self.status == LicenseStatus::Verified && self.expiration_date.is_some()
    }

    /// Verified but already past its expiration date.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == LicenseStatus::Verified
            && self.expiration_date.is_some_and(|exp| exp < now)
    }

    /// The object key to purge, ignoring blank values.
    pub fn object_key(&self) -> Option<&str> {
        self.storage_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn license(status: LicenseStatus, expiration: Option<DateTime<Utc>>) -> License {
        License {
            id: LicenseId::new(),
            store_id: StoreId::new(),
            status,
            expiration_date: expiration,
            media_id: None,
            storage_key: None,
        }
    }

    #[test]
    fn only_verified_dated_licenses_are_warnable() {
        let at = Utc::now();
        assert!(license(LicenseStatus::Verified, Some(at)).is_warnable());
        assert!(!license(LicenseStatus::Verified, None).is_warnable());
        assert!(!license(LicenseStatus::Pending, Some(at)).is_warnable());
    }

    #[test]
    fn lapsed_requires_past_expiration() {
        let now = Utc::now();
        assert!(license(LicenseStatus::Verified, Some(now - Duration::hours(1))).is_lapsed(now));
        assert!(!license(LicenseStatus::Verified, Some(now)).is_lapsed(now));
        assert!(!license(LicenseStatus::Expired, Some(now - Duration::days(2))).is_lapsed(now));
    }

    #[test]
    fn blank_storage_keys_are_ignored() {
        let mut l = license(LicenseStatus::Expired, None);
        l.storage_key = Some("   ".into());
        assert_eq!(l.object_key(), None);
        l.storage_key = Some("license/key".into());
        assert_eq!(l.object_key(), Some("license/key"));
    }
}
