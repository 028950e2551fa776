//! Collaborator contracts: the only knowledge the core has of the domain
//! tables it borrows.
//!
//! Methods taking `tx` must run on that transaction; the rest read committed
//! state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bazaar_billing::Subscription;
use bazaar_core::{LicenseId, MediaId, OrderId, ProductId, StoreId, SubscriptionId};
use bazaar_licensing::{KycStatus, License, LicenseStatus, Store};
use bazaar_media::{Attachment, Media};
use bazaar_orders::VendorOrder;

use crate::error::ServiceResult;
use crate::outbox::OutboxStore;
use crate::tx::{TxBackend, TxRunner};

#[async_trait]
pub trait LicensesRepository<Tx: Send>: Send + Sync {
    /// Licenses expiring in `[from, to)` whose status is not `expired`.
    async fn find_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>>;

    /// Verified licenses whose expiration date lies in `[from, to)`.
    async fn find_expired_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>>;

    /// Expired licenses whose expiration date is at or before `cutoff`.
    async fn find_expired_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<License>>;

    async fn update_status(
        &self,
        tx: &mut Tx,
        id: LicenseId,
        status: LicenseStatus,
    ) -> ServiceResult<()>;

    async fn list_statuses(&self, tx: &mut Tx, store_id: StoreId)
    -> ServiceResult<Vec<LicenseStatus>>;

    async fn delete(&self, tx: &mut Tx, id: LicenseId) -> ServiceResult<()>;
}

#[async_trait]
pub trait StoreRepository<Tx: Send>: Send + Sync {
    async fn update_status(&self, tx: &mut Tx, id: StoreId, status: KycStatus)
    -> ServiceResult<()>;

    async fn find_by_id(&self, tx: &mut Tx, id: StoreId) -> ServiceResult<Store>;

    async fn update(&self, tx: &mut Tx, store: &Store) -> ServiceResult<()>;

    async fn update_subscription_active(
        &self,
        tx: &mut Tx,
        id: StoreId,
        active: bool,
    ) -> ServiceResult<()>;
}

#[async_trait]
pub trait MediaRepository<Tx: Send>: Send + Sync {
    async fn delete(&self, tx: &mut Tx, id: MediaId) -> ServiceResult<()>;

    /// Pending media created strictly before `cutoff`.
    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<Media>>;
}

#[async_trait]
pub trait AttachmentRepository<Tx: Send>: Send + Sync {
    async fn list_by_media_id(&self, media_id: MediaId) -> ServiceResult<Vec<Attachment>>;

    async fn delete(
        &self,
        tx: &mut Tx,
        entity_type: &str,
        entity_id: &str,
        media_id: MediaId,
    ) -> ServiceResult<()>;

    async fn delete_by_media_id(&self, tx: &mut Tx, media_id: MediaId) -> ServiceResult<u64>;
}

#[async_trait]
pub trait OrdersRepository<Tx: Send>: Send + Sync {
    /// Orders still in `created_pending` created strictly before `cutoff`.
    async fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ServiceResult<Vec<VendorOrder>>;

    /// Re-read an order under a row lock held until `tx` ends.
    async fn lock_for_update(&self, tx: &mut Tx, id: OrderId)
    -> ServiceResult<Option<VendorOrder>>;

    /// Persist the order row and its line-item statuses.
    async fn update(&self, tx: &mut Tx, order: &VendorOrder) -> ServiceResult<()>;
}

#[async_trait]
pub trait InventoryRepository<Tx: Send>: Send + Sync {
    async fn release_reservation(
        &self,
        tx: &mut Tx,
        product_id: ProductId,
        quantity: i64,
    ) -> ServiceResult<()>;
}

#[async_trait]
pub trait NotificationsRepository<Tx: Send>: Send + Sync {
    async fn delete_created_before(&self, tx: &mut Tx, cutoff: DateTime<Utc>)
    -> ServiceResult<u64>;
}

#[async_trait]
pub trait BillingRepository<Tx: Send>: Send + Sync {
    /// Most recent subscription of the store, any status.
    async fn find_subscription(&self, store_id: StoreId) -> ServiceResult<Option<Subscription>>;

    /// The store's single non-canceled subscription, if any.
    async fn find_active_subscription(
        &self,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>>;

    async fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>>;

    /// Bounded candidate set for periodic reconciliation: every non-canceled
    /// row plus canceled rows touched since `since`, oldest first.
    async fn list_subscriptions_for_reconciliation(
        &self,
        limit: usize,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<Subscription>>;

    async fn lock_active_for_store(
        &self,
        tx: &mut Tx,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>>;

    async fn lock_by_external_id(
        &self,
        tx: &mut Tx,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>>;

    async fn lock_by_id(
        &self,
        tx: &mut Tx,
        id: SubscriptionId,
    ) -> ServiceResult<Option<Subscription>>;

    async fn create_subscription(&self, tx: &mut Tx, sub: &Subscription) -> ServiceResult<()>;

    async fn update_subscription(&self, tx: &mut Tx, sub: &Subscription) -> ServiceResult<()>;
}

/// A billing repository bound to one open transaction.
pub struct BillingTx<'a, Tx: Send> {
    repo: &'a dyn BillingRepository<Tx>,
    tx: &'a mut Tx,
}

impl<'a, Tx: Send> BillingTx<'a, Tx> {
    pub fn new(repo: &'a dyn BillingRepository<Tx>, tx: &'a mut Tx) -> Self {
        Self { repo, tx }
    }

    pub async fn lock_active_for_store(
        &mut self,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>> {
        self.repo.lock_active_for_store(&mut *self.tx, store_id).await
    }

    pub async fn lock_by_external_id(
        &mut self,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        self.repo.lock_by_external_id(&mut *self.tx, external_id).await
    }

    pub async fn lock_by_id(&mut self, id: SubscriptionId) -> ServiceResult<Option<Subscription>> {
        self.repo.lock_by_id(&mut *self.tx, id).await
    }

    pub async fn create(&mut self, sub: &Subscription) -> ServiceResult<()> {
        self.repo.create_subscription(&mut *self.tx, sub).await
    }

    pub async fn update(&mut self, sub: &Subscription) -> ServiceResult<()> {
        self.repo.update_subscription(&mut *self.tx, sub).await
    }

    /// Hand the transaction back for writes outside the billing tables.
    pub fn tx(&mut self) -> &mut Tx {
        &mut *self.tx
    }
}

/// Every contract the core consumes, bound to one transaction type.
pub struct Repositories<Tx> {
    pub tx: TxRunner<Tx>,
    pub outbox: Arc<dyn OutboxStore<Tx>>,
    pub licenses: Arc<dyn LicensesRepository<Tx>>,
    pub stores: Arc<dyn StoreRepository<Tx>>,
    pub media: Arc<dyn MediaRepository<Tx>>,
    pub attachments: Arc<dyn AttachmentRepository<Tx>>,
    pub orders: Arc<dyn OrdersRepository<Tx>>,
    pub inventory: Arc<dyn InventoryRepository<Tx>>,
    pub notifications: Arc<dyn NotificationsRepository<Tx>>,
    pub billing: Arc<dyn BillingRepository<Tx>>,
}

impl<Tx> Clone for Repositories<Tx> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            outbox: Arc::clone(&self.outbox),
            licenses: Arc::clone(&self.licenses),
            stores: Arc::clone(&self.stores),
            media: Arc::clone(&self.media),
            attachments: Arc::clone(&self.attachments),
            orders: Arc::clone(&self.orders),
            inventory: Arc::clone(&self.inventory),
            notifications: Arc::clone(&self.notifications),
            billing: Arc::clone(&self.billing),
        }
    }
}

impl<Tx: Send + 'static> Repositories<Tx> {
    /// Wire every contract to one store that implements them all.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TxBackend<Tx>
            + OutboxStore<Tx>
            + LicensesRepository<Tx>
            + StoreRepository<Tx>
            + MediaRepository<Tx>
            + AttachmentRepository<Tx>
            + OrdersRepository<Tx>
            + InventoryRepository<Tx>
            + NotificationsRepository<Tx>
            + BillingRepository<Tx>
            + 'static,
    {
        Self {
            tx: TxRunner::new(store.clone()),
            outbox: store.clone(),
            licenses: store.clone(),
            stores: store.clone(),
            media: store.clone(),
            attachments: store.clone(),
            orders: store.clone(),
            inventory: store.clone(),
            notifications: store.clone(),
            billing: store,
        }
    }
}
