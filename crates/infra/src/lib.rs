//! Infrastructure layer: transactions, outbox, distributed lock, storage
//! adapters, cron scheduling and the subscription reconciler.

pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod external;
pub mod lock;
pub mod memory;
pub mod outbox;
#[cfg(feature = "redis")]
pub mod redis;
pub mod repositories;
pub mod subscriptions;
pub mod tx;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, ConfigLoader, CoreConfig};
pub use error::{ServiceError, ServiceResult};
pub use lock::{DistributedLock, InMemoryLockKv, LockKv};
pub use outbox::{OutboxStore, emit_event};
pub use repositories::Repositories;
pub use subscriptions::{CreateSubscriptionInput, SubscriptionService};
pub use tx::{TxBackend, TxRunner};
