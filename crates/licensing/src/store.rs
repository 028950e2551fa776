use serde::{Deserialize, Serialize};

use bazaar_core::{DomainError, StoreId};

use crate::license::LicenseStatus;

/// Store verification state, derived from the statuses of its licenses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    PendingVerification,
    Verified,
    Rejected,
    Expired,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::PendingVerification => "pending_verification",
            KycStatus::Verified => "verified",
            KycStatus::Rejected => "rejected",
            KycStatus::Expired => "expired",
        }
    }
}

impl core::str::FromStr for KycStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_verification" => Ok(KycStatus::PendingVerification),
            "verified" => Ok(KycStatus::Verified),
            "rejected" => Ok(KycStatus::Rejected),
            "expired" => Ok(KycStatus::Expired),
            other => Err(DomainError::unknown_tag("kyc status", other)),
        }
    }
}

/// The slice of a store row the core reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub kyc_status: KycStatus,
    /// Entitlement flag gating paid features.
    pub subscription_active: bool,
}

/// Derive a store's KYC status from all of its license statuses.
///
/// Precedence: any verified, then any rejected, then any expired; a store
/// with none of those (including no licenses at all) is pending.
pub fn determine_store_kyc_status(statuses: &[LicenseStatus]) -> KycStatus {
    let has = |wanted: LicenseStatus| statuses.iter().any(|s| *s == wanted);

    if has(LicenseStatus::Verified) {
        KycStatus::Verified
    } else if has(LicenseStatus::Rejected) {
        KycStatus::Rejected
    } else if has(LicenseStatus::Expired) {
        KycStatus::Expired
    } else {
        KycStatus::PendingVerification
    }
}
