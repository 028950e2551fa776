//! In-memory database for tests/dev.
//!
//! All tables live in one [`Tables`] value. A transaction clones the
//! committed tables on begin, works on its private copy and swaps it back on
//! commit; rollback simply drops the copy. A single writer mutex serializes
//! transactions, which gives every `lock_*` read row-lock semantics.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use bazaar_billing::{Subscription, SubscriptionStatus};
use bazaar_core::{
    AggregateId, LicenseId, MediaId, OrderId, ProductId, StoreId, SubscriptionId,
};
use bazaar_events::{
    AggregateType, DlqReason, EventType, NewOutboxEvent, OutboxDlqEntry, OutboxEvent,
};
use bazaar_licensing::{KycStatus, License, LicenseStatus, Store};
use bazaar_media::{Attachment, Media, MediaStatus};
use bazaar_orders::{VendorOrder, VendorOrderStatus};

use crate::error::{ServiceError, ServiceResult};
use crate::outbox::OutboxStore;
use crate::repositories::{
    AttachmentRepository, BillingRepository, InventoryRepository, LicensesRepository,
    MediaRepository, NotificationsRepository, OrdersRepository, StoreRepository,
};
use crate::tx::TxBackend;

/// A stored notification; only its age matters to retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub store_id: StoreId,
    pub created_at: DateTime<Utc>,
}

/// Every table the core touches, in storage (insertion) order.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub outbox: Vec<OutboxEvent>,
    pub outbox_dlq: Vec<OutboxDlqEntry>,
    pub stores: BTreeMap<StoreId, Store>,
    pub licenses: Vec<License>,
    pub media: Vec<Media>,
    pub attachments: Vec<Attachment>,
    pub orders: Vec<VendorOrder>,
    /// Reserved quantity per product.
    pub reservations: HashMap<ProductId, i64>,
    /// Every `release_reservation` call, in order.
    pub released: Vec<(ProductId, i64)>,
    pub notifications: Vec<NotificationRecord>,
    pub subscriptions: Vec<Subscription>,
}

impl Tables {
    fn events_of(
        &self,
        event_type: Option<EventType>,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> impl Iterator<Item = &OutboxEvent> {
        self.outbox.iter().filter(move |e| {
            e.aggregate_type == aggregate_type
                && e.aggregate_id == aggregate_id
                && event_type.is_none_or(|t| e.event_type == t)
        })
    }

    /// Live or dead-lettered: a DLQ row still counts as emitted.
    fn has_emitted(
        &self,
        event_type: EventType,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> bool {
        self.events_of(Some(event_type), aggregate_type, aggregate_id)
            .next()
            .is_some()
            || self.outbox_dlq.iter().any(|d| {
                d.event_type == event_type
                    && d.aggregate_type == aggregate_type
                    && d.aggregate_id == aggregate_id
            })
    }

    fn outbox_row(&mut self, id: Uuid) -> ServiceResult<&mut OutboxEvent> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ServiceError::not_found(format!("outbox event {id}")))
    }

    fn store_mut(&mut self, id: StoreId) -> ServiceResult<&mut Store> {
        self.stores
            .get_mut(&id)
            .ok_or_else(|| ServiceError::not_found(format!("store {id}")))
    }

    fn active_subscription(&self, store_id: StoreId) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .rev()
            .find(|s| s.store_id == store_id && s.is_active())
    }
}

/// Transaction over [`MemoryDb`]: a private copy of the tables plus the
/// writer guard.
pub struct MemoryTx {
    tables: Tables,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTx {
    pub fn tables(&self) -> &Tables {
        &self.tables
    }
}

/// Shared handle to the in-memory database. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryDb {
    committed: Arc<Mutex<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    faults: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn committed(&self) -> MutexGuard<'_, Tables> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate committed state directly (fixtures).
    pub fn seed(&self, f: impl FnOnce(&mut Tables)) {
        f(&mut self.committed());
    }

    /// Copy of the committed tables.
    pub fn snapshot(&self) -> Tables {
        self.committed().clone()
    }

    /// Make the named operation fail with a dependency error until cleared.
    ///
    /// Names are `"<table>.<op>"`, optionally suffixed with `:<id>` to target
    /// one row (e.g. `"licenses.update_status:<uuid>"`).
    pub fn inject_fault(&self, name: impl Into<String>) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into());
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check(&self, op: &str, id: Option<&dyn std::fmt::Display>) -> ServiceResult<()> {
        let faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let targeted = id.map(|id| format!("{op}:{id}"));
        if faults.contains(op) || targeted.is_some_and(|t| faults.contains(&t)) {
            return Err(ServiceError::dependency(format!("injected fault: {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TxBackend<MemoryTx> for MemoryDb {
    async fn begin(&self) -> ServiceResult<MemoryTx> {
        self.check("tx.begin", None)?;
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let tables = self.committed().clone();
        Ok(MemoryTx {
            tables,
            _guard: guard,
        })
    }

    async fn commit(&self, tx: MemoryTx) -> ServiceResult<()> {
        self.check("tx.commit", None)?;
        *self.committed() = tx.tables;
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> ServiceResult<()> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore<MemoryTx> for MemoryDb {
    async fn emit(&self, tx: &mut MemoryTx, event: NewOutboxEvent) -> ServiceResult<OutboxEvent> {
        self.check("outbox.emit", None)?;
        let row = OutboxEvent::from_new(event, Utc::now());
        tx.tables.outbox.push(row.clone());
        Ok(row)
    }

    async fn exists(
        &self,
        event_type: EventType,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<bool> {
        self.check("outbox.exists", Some(&aggregate_id))?;
        Ok(self
            .committed()
            .has_emitted(event_type, aggregate_type, aggregate_id))
    }

    async fn delete_published_before(
        &self,
        tx: &mut MemoryTx,
        cutoff: DateTime<Utc>,
        min_attempts: u32,
    ) -> ServiceResult<u64> {
        self.check("outbox.delete_published_before", None)?;
        let before = tx.tables.outbox.len();
        tx.tables.outbox.retain(|e| {
            !(e.published_at.is_some_and(|p| p < cutoff) && e.attempt_count >= min_attempts)
        });
        Ok((before - tx.tables.outbox.len()) as u64)
    }

    async fn move_to_dlq(
        &self,
        tx: &mut MemoryTx,
        event_id: Uuid,
        reason: DlqReason,
        message: Option<String>,
        failed_at: DateTime<Utc>,
    ) -> ServiceResult<OutboxDlqEntry> {
        let idx = tx
            .tables
            .outbox
            .iter()
            .position(|e| e.id == event_id)
            .ok_or_else(|| ServiceError::not_found(format!("outbox event {event_id}")))?;
        let event = tx.tables.outbox.remove(idx);
        let entry = OutboxDlqEntry::from_event(event, reason, message, failed_at);
        tx.tables.outbox_dlq.push(entry.clone());
        Ok(entry)
    }

    async fn list_for_aggregate(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    ) -> ServiceResult<Vec<OutboxEvent>> {
        Ok(self
            .committed()
            .events_of(None, aggregate_type, aggregate_id)
            .cloned()
            .collect())
    }

    async fn mark_published(
        &self,
        tx: &mut MemoryTx,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let row = tx.tables.outbox_row(id)?;
        if row.published_at.is_none() {
            row.published_at = Some(at);
        }
        Ok(())
    }

    async fn record_failure(&self, tx: &mut MemoryTx, id: Uuid, error: &str) -> ServiceResult<()> {
        let row = tx.tables.outbox_row(id)?;
        row.attempt_count = row.attempt_count.saturating_add(1);
        row.last_error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl LicensesRepository<MemoryTx> for MemoryDb {
    async fn find_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>> {
        self.check("licenses.find_expiring_between", None)?;
        Ok(self
            .committed()
            .licenses
            .iter()
            .filter(|l| l.status != LicenseStatus::Expired)
            .filter(|l| l.expiration_date.is_some_and(|e| e >= from && e < to))
            .cloned()
            .collect())
    }

    async fn find_expired_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<Vec<License>> {
        self.check("licenses.find_expired_in_range", None)?;
        Ok(self
            .committed()
            .licenses
            .iter()
            .filter(|l| l.status == LicenseStatus::Verified)
            .filter(|l| l.expiration_date.is_some_and(|e| e >= from && e < to))
            .cloned()
            .collect())
    }

    async fn find_expired_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<License>> {
        self.check("licenses.find_expired_before", None)?;
        Ok(self
            .committed()
            .licenses
            .iter()
            .filter(|l| l.status == LicenseStatus::Expired)
            .filter(|l| l.expiration_date.is_some_and(|e| e <= cutoff))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        tx: &mut MemoryTx,
        id: LicenseId,
        status: LicenseStatus,
    ) -> ServiceResult<()> {
        self.check("licenses.update_status", Some(&id))?;
        let license = tx
            .tables
            .licenses
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| ServiceError::not_found(format!("license {id}")))?;
        license.status = status;
        Ok(())
    }

    async fn list_statuses(
        &self,
        tx: &mut MemoryTx,
        store_id: StoreId,
    ) -> ServiceResult<Vec<LicenseStatus>> {
        Ok(tx
            .tables
            .licenses
            .iter()
            .filter(|l| l.store_id == store_id)
            .map(|l| l.status)
            .collect())
    }

    async fn delete(&self, tx: &mut MemoryTx, id: LicenseId) -> ServiceResult<()> {
        self.check("licenses.delete", Some(&id))?;
        tx.tables.licenses.retain(|l| l.id != id);
        Ok(())
    }
}

#[async_trait]
impl StoreRepository<MemoryTx> for MemoryDb {
    async fn update_status(
        &self,
        tx: &mut MemoryTx,
        id: StoreId,
        status: KycStatus,
    ) -> ServiceResult<()> {
        self.check("stores.update_status", Some(&id))?;
        tx.tables.store_mut(id)?.kyc_status = status;
        Ok(())
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, id: StoreId) -> ServiceResult<Store> {
        tx.tables
            .stores
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("store {id}")))
    }

    async fn update(&self, tx: &mut MemoryTx, store: &Store) -> ServiceResult<()> {
        *tx.tables.store_mut(store.id)? = store.clone();
        Ok(())
    }

    async fn update_subscription_active(
        &self,
        tx: &mut MemoryTx,
        id: StoreId,
        active: bool,
    ) -> ServiceResult<()> {
        self.check("stores.update_subscription_active", Some(&id))?;
        tx.tables.store_mut(id)?.subscription_active = active;
        Ok(())
    }
}

#[async_trait]
impl MediaRepository<MemoryTx> for MemoryDb {
    async fn delete(&self, tx: &mut MemoryTx, id: MediaId) -> ServiceResult<()> {
        self.check("media.delete", Some(&id))?;
        tx.tables.media.retain(|m| m.id != id);
        Ok(())
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<Media>> {
        self.check("media.list_pending_before", None)?;
        Ok(self
            .committed()
            .media
            .iter()
            .filter(|m| m.status == MediaStatus::Pending && m.created_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AttachmentRepository<MemoryTx> for MemoryDb {
    async fn list_by_media_id(&self, media_id: MediaId) -> ServiceResult<Vec<Attachment>> {
        self.check("attachments.list_by_media_id", Some(&media_id))?;
        Ok(self
            .committed()
            .attachments
            .iter()
            .filter(|a| a.media_id == media_id)
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        tx: &mut MemoryTx,
        entity_type: &str,
        entity_id: &str,
        media_id: MediaId,
    ) -> ServiceResult<()> {
        self.check("attachments.delete", Some(&media_id))?;
        tx.tables.attachments.retain(|a| {
            !(a.entity_type == entity_type && a.entity_id == entity_id && a.media_id == media_id)
        });
        Ok(())
    }

    async fn delete_by_media_id(&self, tx: &mut MemoryTx, media_id: MediaId) -> ServiceResult<u64> {
        self.check("attachments.delete_by_media_id", Some(&media_id))?;
        let before = tx.tables.attachments.len();
        tx.tables.attachments.retain(|a| a.media_id != media_id);
        Ok((before - tx.tables.attachments.len()) as u64)
    }
}

#[async_trait]
impl OrdersRepository<MemoryTx> for MemoryDb {
    async fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ServiceResult<Vec<VendorOrder>> {
        self.check("orders.find_pending_created_before", None)?;
        Ok(self
            .committed()
            .orders
            .iter()
            .filter(|o| o.status == VendorOrderStatus::CreatedPending && o.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn lock_for_update(
        &self,
        tx: &mut MemoryTx,
        id: OrderId,
    ) -> ServiceResult<Option<VendorOrder>> {
        self.check("orders.lock_for_update", Some(&id))?;
        Ok(tx.tables.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn update(&self, tx: &mut MemoryTx, order: &VendorOrder) -> ServiceResult<()> {
        self.check("orders.update", Some(&order.id))?;
        let row = tx
            .tables
            .orders
            .iter_mut()
            .find(|o| o.id == order.id)
            .ok_or_else(|| ServiceError::not_found(format!("order {}", order.id)))?;
        *row = order.clone();
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository<MemoryTx> for MemoryDb {
    async fn release_reservation(
        &self,
        tx: &mut MemoryTx,
        product_id: ProductId,
        quantity: i64,
    ) -> ServiceResult<()> {
        self.check("inventory.release_reservation", Some(&product_id))?;
        let reserved = tx.tables.reservations.entry(product_id).or_default();
        *reserved = (*reserved - quantity).max(0);
        tx.tables.released.push((product_id, quantity));
        Ok(())
    }
}

#[async_trait]
impl NotificationsRepository<MemoryTx> for MemoryDb {
    async fn delete_created_before(
        &self,
        tx: &mut MemoryTx,
        cutoff: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        self.check("notifications.delete_created_before", None)?;
        let before = tx.tables.notifications.len();
        tx.tables.notifications.retain(|n| n.created_at >= cutoff);
        Ok((before - tx.tables.notifications.len()) as u64)
    }
}

#[async_trait]
impl BillingRepository<MemoryTx> for MemoryDb {
    async fn find_subscription(&self, store_id: StoreId) -> ServiceResult<Option<Subscription>> {
        Ok(self
            .committed()
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.store_id == store_id)
            .cloned())
    }

    async fn find_active_subscription(
        &self,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>> {
        self.check("subscriptions.find_active", Some(&store_id))?;
        Ok(self.committed().active_subscription(store_id).cloned())
    }

    async fn find_subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        Ok(self
            .committed()
            .subscriptions
            .iter()
            .find(|s| s.external_subscription_id == external_id)
            .cloned())
    }

    async fn list_subscriptions_for_reconciliation(
        &self,
        limit: usize,
        since: DateTime<Utc>,
    ) -> ServiceResult<Vec<Subscription>> {
        self.check("subscriptions.list_for_reconciliation", None)?;
        let tables = self.committed();
        let mut candidates: Vec<Subscription> = tables
            .subscriptions
            .iter()
            .filter(|s| {
                s.status != SubscriptionStatus::Canceled
                    || s.canceled_at.is_some_and(|at| at >= since)
                    || s.current_period_end.is_some_and(|at| at >= since)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|s| s.created_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn lock_active_for_store(
        &self,
        tx: &mut MemoryTx,
        store_id: StoreId,
    ) -> ServiceResult<Option<Subscription>> {
        Ok(tx.tables.active_subscription(store_id).cloned())
    }

    async fn lock_by_external_id(
        &self,
        tx: &mut MemoryTx,
        external_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        Ok(tx
            .tables
            .subscriptions
            .iter()
            .find(|s| s.external_subscription_id == external_id)
            .cloned())
    }

    async fn lock_by_id(
        &self,
        tx: &mut MemoryTx,
        id: SubscriptionId,
    ) -> ServiceResult<Option<Subscription>> {
        Ok(tx.tables.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn create_subscription(&self, tx: &mut MemoryTx, sub: &Subscription) -> ServiceResult<()> {
        self.check("subscriptions.create", Some(&sub.store_id))?;
        let tables = &mut tx.tables;
        if tables
            .subscriptions
            .iter()
            .any(|s| s.external_subscription_id == sub.external_subscription_id)
        {
            return Err(ServiceError::conflict(format!(
                "external subscription {} already stored",
                sub.external_subscription_id
            )));
        }
        if sub.is_active() && tables.active_subscription(sub.store_id).is_some() {
            return Err(ServiceError::conflict(format!(
                "store {} already has an active subscription",
                sub.store_id
            )));
        }
        tables.subscriptions.push(sub.clone());
        Ok(())
    }

    async fn update_subscription(&self, tx: &mut MemoryTx, sub: &Subscription) -> ServiceResult<()> {
        self.check("subscriptions.update", Some(&sub.id))?;
        let row = tx
            .tables
            .subscriptions
            .iter_mut()
            .find(|s| s.id == sub.id)
            .ok_or_else(|| ServiceError::not_found(format!("subscription {}", sub.id)))?;
        *row = sub.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxRunner;

    fn store(kyc: KycStatus) -> Store {
        Store {
            id: StoreId::new(),
            kyc_status: kyc,
            subscription_active: false,
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_rolled_back() {
        let db = MemoryDb::new();
        let s = store(KycStatus::Verified);
        let store_id = s.id;
        db.seed(|t| {
            t.stores.insert(store_id, s);
        });

        let runner = TxRunner::new(Arc::new(db.clone()));
        let repo = db.clone();
        let err = runner
            .with_tx(move |tx| {
                Box::pin(async move {
                    StoreRepository::update_status(&repo, tx, store_id, KycStatus::Expired).await?;
                    Err::<(), _>(ServiceError::fatal("abort"))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err, ServiceError::fatal("abort"));
        assert_eq!(db.snapshot().stores[&store_id].kyc_status, KycStatus::Verified);
    }

    #[tokio::test]
    async fn targeted_faults_hit_only_their_row() {
        let db = MemoryDb::new();
        let target = LicenseId::new();
        db.inject_fault(format!("licenses.update_status:{target}"));

        let mut tx = db.begin().await.unwrap();
        let err = LicensesRepository::update_status(&db, &mut tx, target, LicenseStatus::Expired)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Dependency(_)));

        let other = LicensesRepository::update_status(
            &db,
            &mut tx,
            LicenseId::new(),
            LicenseStatus::Expired,
        )
        .await
        .unwrap_err();
        assert!(matches!(other, ServiceError::NotFound(_)));
        db.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    async fn outbox_reader_side_tracks_attempts_and_dlq() {
        let db = MemoryDb::new();
        let aggregate = AggregateId::new();
        let new = NewOutboxEvent {
            id: Uuid::now_v7(),
            event_type: EventType::OrderExpired,
            aggregate_type: AggregateType::VendorOrder,
            aggregate_id: aggregate,
            event_version: 1,
            occurred_at: Utc::now(),
            payload: br#"{"orderId":"x"}"#.to_vec(),
        };
        let id = new.id;

        let mut tx = db.begin().await.unwrap();
        db.emit(&mut tx, new).await.unwrap();
        db.record_failure(&mut tx, id, "timeout").await.unwrap();
        db.record_failure(&mut tx, id, "503").await.unwrap();
        db.commit(tx).await.unwrap();

        let rows = db
            .list_for_aggregate(AggregateType::VendorOrder, aggregate)
            .await
            .unwrap();
        assert_eq!(rows[0].attempt_count, 2);
        assert_eq!(rows[0].last_error.as_deref(), Some("503"));

        let mut tx = db.begin().await.unwrap();
        let entry = db
            .move_to_dlq(&mut tx, id, DlqReason::MaxAttempts, None, Utc::now())
            .await
            .unwrap();
        db.commit(tx).await.unwrap();

        assert_eq!(entry.event_id, id);
        assert_eq!(entry.error_message.as_deref(), Some("503"));
        let tables = db.snapshot();
        assert!(tables.outbox.is_empty());
        assert_eq!(tables.outbox_dlq.len(), 1);
    }
}
