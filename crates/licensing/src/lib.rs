//! Store licenses and the KYC status derived from them.

pub mod events;
pub mod license;
pub mod store;

pub use events::{LicenseExpired, LicenseExpiringSoon, LicenseStatusChanged};
pub use license::{License, LicenseStatus};
pub use store::{KycStatus, Store, determine_store_kyc_status};
