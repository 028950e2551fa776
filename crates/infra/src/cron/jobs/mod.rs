//! The maintenance jobs, in the order the worker registers them.

pub mod license_lifecycle;
pub mod order_ttl;
pub mod pending_media;
pub mod retention;
pub mod subscription_reconcile;

pub use license_lifecycle::{LICENSE_LIFECYCLE_JOB, LicenseLifecycleJob};
pub use order_ttl::{ORDER_TTL_JOB, OrderTtlJob};
pub use pending_media::{PENDING_MEDIA_CLEANUP_JOB, PendingMediaCleanupJob};
pub use retention::{
    NOTIFICATION_RETENTION_JOB, NotificationRetentionJob, OUTBOX_RETENTION_JOB,
    OutboxRetentionJob,
};
pub use subscription_reconcile::{SUBSCRIPTION_RECONCILE_JOB, SubscriptionReconcileJob};
