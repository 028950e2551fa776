//! End-to-end scenarios over the in-memory adapters: full scheduler cycles
//! with every job registered, plus the subscription reconciler against a
//! scripted provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bazaar_billing::{
    ActionKind, ProviderAction, ProviderItem, ProviderSubscription, Subscription,
    SubscriptionStatus, provider_date_start,
};
use bazaar_core::{
    CheckoutGroupId, Clock, LicenseId, LineItemId, MediaId, OrderId, ProductId, StoreId, days,
};
use bazaar_events::{AggregateType, EventType};
use bazaar_licensing::{
    KycStatus, License, LicenseExpired, LicenseExpiringSoon, LicenseStatus, Store,
};
use bazaar_media::{Attachment, Media, MediaStatus};
use bazaar_observability::CronMetricsRegistry;
use bazaar_orders::{LineItem, LineItemStatus, OrderExpired, VendorOrder, VendorOrderStatus};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::cron::jobs::{
    LicenseLifecycleJob, NotificationRetentionJob, OrderTtlJob, OutboxRetentionJob,
    PendingMediaCleanupJob, SubscriptionReconcileJob,
};
use crate::cron::{CronJob, Registry, Scheduler};
use crate::error::{ServiceError, ServiceResult};
use crate::external::InMemoryObjectStorage;
use crate::lock::{DistributedLock, InMemoryLockKv, LockKv};
use crate::memory::{MemoryDb, MemoryTx};
use crate::repositories::Repositories;
use crate::subscriptions::SubscriptionService;
use crate::subscriptions::fake::{FakeBillingProvider, api_error};

const LOCK_KEY: &str = "bazaar:cron:lock";
const BUCKET: &str = "license-docs";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap()
}

struct World {
    db: MemoryDb,
    kv: InMemoryLockKv,
    metrics: CronMetricsRegistry,
    storage: InMemoryObjectStorage,
    provider: Arc<FakeBillingProvider>,
    service: Arc<SubscriptionService<MemoryTx>>,
    registry: Registry,
}

impl World {
    fn new() -> Self {
        let db = MemoryDb::new();
        let repos = Repositories::from_store(Arc::new(db.clone()));
        let clock = Clock::fixed(now());
        let config = CoreConfig::default();
        let storage = InMemoryObjectStorage::new();
        let provider = Arc::new(FakeBillingProvider::new());
        let service = Arc::new(SubscriptionService::new(
            repos.clone(),
            provider.clone(),
            "plan_default",
            clock.clone(),
        ));

        let mut registry = Registry::new();
        registry
            .register(Some(Arc::new(
                LicenseLifecycleJob::new(repos.clone(), config.license.clone(), clock.clone())
                    .with_storage(Arc::new(storage.clone()), BUCKET),
            )))
            .register(Some(Arc::new(OrderTtlJob::new(
                repos.clone(),
                config.orders.clone(),
                clock.clone(),
            ))))
            .register(Some(Arc::new(NotificationRetentionJob::new(
                repos.clone(),
                &config.notifications,
                clock.clone(),
            ))))
            .register(Some(Arc::new(OutboxRetentionJob::new(
                repos.clone(),
                &config.outbox,
                clock.clone(),
            ))))
            .register(Some(Arc::new(PendingMediaCleanupJob::new(
                repos.clone(),
                &config.media,
                clock.clone(),
            ))))
            .register(Some(Arc::new(SubscriptionReconcileJob::new(
                repos,
                service.clone(),
                &config.subscriptions,
                clock,
            ))));

        Self {
            db,
            kv: InMemoryLockKv::new(),
            metrics: CronMetricsRegistry::new(),
            storage,
            provider,
            service,
            registry,
        }
    }

    fn scheduler(&self) -> Scheduler {
        let lock = DistributedLock::new(Arc::new(self.kv.clone()), LOCK_KEY, Duration::from_secs(60));
        Scheduler::new(
            self.registry.clone(),
            Arc::new(lock),
            Arc::new(self.metrics.clone()),
            Duration::from_secs(86_400),
        )
    }

    async fn cycle(&self) {
        self.scheduler()
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
    }

    fn store(&self, kyc_status: KycStatus) -> StoreId {
        let id = StoreId::new();
        self.db.seed(|t| {
            t.stores.insert(
                id,
                Store {
                    id,
                    kyc_status,
                    subscription_active: false,
                },
            );
        });
        id
    }

    fn license(&self, store_id: StoreId, status: LicenseStatus, expires: DateTime<Utc>) -> License {
        let license = License {
            id: LicenseId::new(),
            store_id,
            status,
            expiration_date: Some(expires),
            media_id: None,
            storage_key: None,
        };
        self.db.seed(|t| t.licenses.push(license.clone()));
        license
    }

    fn events(&self, event_type: EventType) -> usize {
        self.db
            .snapshot()
            .outbox
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[tokio::test]
async fn warning_is_emitted_once_across_cycles() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    let license = world.license(store_id, LicenseStatus::Verified, now() + days(14));

    world.cycle().await;
    world.cycle().await;

    assert_eq!(world.events(EventType::LicenseExpiringSoon), 1);
    let snap = world.db.snapshot();
    assert_eq!(snap.licenses[0].status, LicenseStatus::Verified);
    assert_eq!(snap.stores[&store_id].kyc_status, KycStatus::Verified);

    let event = &snap.outbox[0];
    assert_eq!(event.aggregate_type, AggregateType::License);
    assert_eq!(event.aggregate_id, license.id.into());
    let payload: LicenseExpiringSoon = event.decode().unwrap();
    assert_eq!(payload.license_id, license.id);
    assert_eq!(payload.days_until_expiry, 14);
}

#[tokio::test]
async fn expiring_the_only_verified_license_cascades_to_the_store() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    let license = world.license(store_id, LicenseStatus::Verified, now() - days(1));

    world.cycle().await;

    let snap = world.db.snapshot();
    assert_eq!(snap.licenses[0].status, LicenseStatus::Expired);
    assert_eq!(snap.stores[&store_id].kyc_status, KycStatus::Expired);
    assert_eq!(world.events(EventType::LicenseExpired), 1);

    let expired = snap
        .outbox
        .iter()
        .find(|e| e.event_type == EventType::LicenseExpired)
        .unwrap();
    let payload: LicenseExpired = expired.decode().unwrap();
    assert_eq!(payload.license_id, license.id);
    assert_eq!(payload.expired_at, now());
}

#[tokio::test]
async fn hard_delete_purges_attachments_object_and_rows() {
    let world = World::new();
    let store_id = world.store(KycStatus::Expired);
    let media_id = MediaId::new();
    let license_id = LicenseId::new();
    world.db.seed(|t| {
        t.licenses.push(License {
            id: license_id,
            store_id,
            status: LicenseStatus::Expired,
            expiration_date: Some(now() - days(40)),
            media_id: Some(media_id),
            storage_key: Some("license/key".to_string()),
        });
        t.media.push(Media {
            id: media_id,
            store_id,
            status: MediaStatus::Uploaded,
            object_key: "license/key".to_string(),
            created_at: now() - days(400),
        });
        t.attachments.push(Attachment {
            entity_type: "license".to_string(),
            entity_id: license_id.to_string(),
            media_id,
        });
    });
    world.storage.put(BUCKET, "license/key");

    world.cycle().await;

    let snap = world.db.snapshot();
    assert!(snap.attachments.is_empty());
    assert!(snap.licenses.is_empty());
    assert!(snap.media.is_empty());
    assert_eq!(
        world.storage.deletes(),
        vec![(BUCKET.to_string(), "license/key".to_string())]
    );
    assert!(!world.storage.contains(BUCKET, "license/key"));
}

#[tokio::test]
async fn order_expiry_releases_reserved_inventory() {
    let world = World::new();
    let product = ProductId::new();
    let order = VendorOrder {
        id: OrderId::new(),
        checkout_group_id: CheckoutGroupId::new(),
        buyer_store_id: StoreId::new(),
        vendor_store_id: StoreId::new(),
        status: VendorOrderStatus::CreatedPending,
        balance_due_cents: 9_900,
        created_at: now() - days(11),
        expired_at: None,
        line_items: vec![LineItem {
            id: LineItemId::new(),
            product_id: product,
            quantity: 3,
            status: LineItemStatus::Pending,
        }],
    };
    world.db.seed(|t| {
        t.orders.push(order.clone());
        t.reservations.insert(product, 3);
    });

    world.cycle().await;

    let snap = world.db.snapshot();
    assert_eq!(snap.released, vec![(product, 3)]);
    let row = &snap.orders[0];
    assert_eq!(row.line_items[0].status, LineItemStatus::Rejected);
    assert_eq!(row.status, VendorOrderStatus::Expired);
    assert_eq!(row.expired_at, Some(now()));
    assert_eq!(world.events(EventType::OrderExpired), 1);

    let expired = snap
        .outbox
        .iter()
        .find(|e| e.event_type == EventType::OrderExpired)
        .unwrap();
    let payload: OrderExpired = expired.decode().unwrap();
    assert_eq!(payload.order_id, order.id);
    assert_eq!(payload.checkout_group_id, order.checkout_group_id);
}

struct Failing;

#[async_trait]
impl CronJob for Failing {
    fn name(&self) -> &str {
        "fail"
    }

    async fn run(&self, _ctx: &CancellationToken) -> ServiceResult<()> {
        Err(ServiceError::dependency("downstream unavailable"))
    }
}

#[tokio::test]
async fn failing_job_is_counted_and_the_rest_still_run() {
    let mut world = World::new();
    world.registry.register(Some(Arc::new(Failing)));
    let store_id = world.store(KycStatus::Verified);
    world.license(store_id, LicenseStatus::Verified, now() - days(1));

    world.cycle().await;

    assert_eq!(world.metrics.snapshot("fail").failed, 1);
    assert_eq!(world.metrics.snapshot("license_lifecycle").succeeded, 1);
    assert_eq!(world.metrics.snapshot("subscription_reconcile").succeeded, 1);
    assert_eq!(world.metrics.total_runs(), 7);
    assert_eq!(world.events(EventType::LicenseExpired), 1);
}

#[tokio::test]
async fn held_lock_means_no_jobs_and_no_metrics() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    world.license(store_id, LicenseStatus::Verified, now() - days(1));
    world
        .kv
        .set_nx(LOCK_KEY, "other-replica", Duration::from_secs(60))
        .await
        .unwrap();

    world.cycle().await;

    assert_eq!(world.metrics.total_runs(), 0);
    assert!(world.db.snapshot().outbox.is_empty());
    assert_eq!(world.db.snapshot().licenses[0].status, LicenseStatus::Verified);
    assert_eq!(
        world.kv.get(LOCK_KEY).await.unwrap().as_deref(),
        Some("other-replica")
    );
}

#[tokio::test]
async fn failed_emit_rolls_back_the_business_write() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    world.license(store_id, LicenseStatus::Verified, now() - days(1));
    world.db.inject_fault("outbox.emit");

    world.cycle().await;

    let snap = world.db.snapshot();
    assert_eq!(snap.licenses[0].status, LicenseStatus::Verified);
    assert_eq!(snap.stores[&store_id].kyc_status, KycStatus::Verified);
    assert!(snap.outbox.is_empty());
    assert_eq!(world.metrics.snapshot("license_lifecycle").failed, 1);

    world.db.clear_faults();
    world.cycle().await;
    assert_eq!(world.db.snapshot().licenses[0].status, LicenseStatus::Expired);
    assert_eq!(world.events(EventType::LicenseExpired), 1);
}

#[tokio::test]
async fn nudges_stay_unique_per_order_across_cycles() {
    let world = World::new();
    let orders: Vec<VendorOrder> = (6..9)
        .map(|age| VendorOrder {
            id: OrderId::new(),
            checkout_group_id: CheckoutGroupId::new(),
            buyer_store_id: StoreId::new(),
            vendor_store_id: StoreId::new(),
            status: VendorOrderStatus::CreatedPending,
            balance_due_cents: 100,
            created_at: now() - days(age),
            expired_at: None,
            line_items: vec![],
        })
        .collect();
    world.db.seed(|t| t.orders.extend(orders.iter().cloned()));

    for _ in 0..3 {
        world.cycle().await;
    }

    let snap = world.db.snapshot();
    for order in &orders {
        let nudges = snap
            .outbox
            .iter()
            .filter(|e| {
                e.event_type == EventType::OrderPendingNudge && e.aggregate_id == order.id.into()
            })
            .count();
        assert_eq!(nudges, 1);
    }
}

#[tokio::test]
async fn published_events_are_retained_until_attempts_are_exhausted() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    world.license(store_id, LicenseStatus::Verified, now() + days(14));
    world.cycle().await;

    let outbox = Repositories::from_store(Arc::new(world.db.clone())).outbox;
    let event_id = world.db.snapshot().outbox[0].id;
    let long_ago = now() - days(60);
    for attempt in 0..4 {
        let outbox = outbox.clone();
        let tx = Repositories::from_store(Arc::new(world.db.clone())).tx;
        tx.with_tx(move |tx| {
            Box::pin(async move {
                outbox
                    .record_failure(tx, event_id, &format!("attempt {attempt}"))
                    .await?;
                outbox.mark_published(tx, event_id, long_ago).await
            })
        })
        .await
        .unwrap();
    }

    world.cycle().await;
    let row = world.db.snapshot().outbox[0].clone();
    assert_eq!(row.attempt_count, 4);
    assert_eq!(row.last_error.as_deref(), Some("attempt 3"));

    let tx = Repositories::from_store(Arc::new(world.db.clone())).tx;
    let bump = outbox.clone();
    tx.with_tx(move |tx| Box::pin(async move { bump.record_failure(tx, event_id, "again").await }))
        .await
        .unwrap();

    world.cycle().await;
    assert!(world.db.snapshot().outbox.is_empty());
}

#[tokio::test]
async fn emitted_payload_round_trips_through_the_outbox() {
    let world = World::new();
    let store_id = world.store(KycStatus::Verified);
    let license = world.license(store_id, LicenseStatus::Verified, now() + days(14));

    world.cycle().await;

    let outbox = Repositories::from_store(Arc::new(world.db.clone())).outbox;
    let rows = outbox
        .list_for_aggregate(AggregateType::License, license.id.into())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt_count, 0);
    assert_eq!(rows[0].published_at, None);

    let decoded: LicenseExpiringSoon = rows[0].decode().unwrap();
    let expected = LicenseExpiringSoon {
        license_id: license.id,
        store_id,
        expiration_date: now() + days(14),
        days_until_expiry: 14,
        occurred_at: now(),
    };
    assert_eq!(decoded, expected);
    assert_eq!(rows[0].payload, serde_json::to_vec(&expected).unwrap());
}

fn seed_subscription(world: &World, external_id: &str) -> (StoreId, Subscription) {
    let store_id = world.store(KycStatus::Verified);
    let mut sub = Subscription::new(store_id, external_id, now() - days(20));
    sub.status = SubscriptionStatus::Active;
    sub.price_id = Some("plan_default".to_string());
    world.db.seed(|t| {
        t.subscriptions.push(sub.clone());
        t.stores.get_mut(&store_id).unwrap().subscription_active = true;
    });
    (store_id, sub)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn pause_already_scheduled_syncs_from_the_provider() {
    let world = World::new();
    let (store_id, sub) = seed_subscription(&world, "sq_x");
    let pause_on = date(2026, 3, 20);
    world.provider.insert(ProviderSubscription {
        id: "sq_x".to_string(),
        status: "ACTIVE".to_string(),
        charged_through_date: Some(pause_on),
        actions: vec![ProviderAction {
            id: "act_pause".to_string(),
            kind: ActionKind::Pause,
            effective_date: Some(pause_on),
        }],
        items: vec![ProviderItem {
            current_period_start: None,
            current_period_end: Some(provider_date_start(pause_on)),
            price_id: Some("plan_default".to_string()),
        }],
        ..ProviderSubscription::default()
    });
    world.provider.fail_next(
        "pause",
        api_error(400, "Subscription sq_x already has a pending pause date."),
    );

    let synced = world.service.pause(store_id).await.unwrap();

    assert_eq!(synced.id, sub.id);
    assert_eq!(synced.pause_effective_at, Some(provider_date_start(pause_on)));
    assert_eq!(synced.current_period_end, Some(provider_date_start(pause_on)));
    assert_eq!(world.provider.calls(), vec!["get", "pause", "get"]);
    let stored = world.db.snapshot().subscriptions[0].clone();
    assert_eq!(stored, synced);
    assert!(world.db.snapshot().stores[&store_id].subscription_active);
}

#[tokio::test]
async fn repeated_reconcile_does_not_drift() {
    let world = World::new();
    let (store_id, _) = seed_subscription(&world, "sq_y");
    world.provider.insert(ProviderSubscription {
        id: "sq_y".to_string(),
        status: "ACTIVE".to_string(),
        charged_through_date: Some(date(2026, 4, 1)),
        actions: vec![ProviderAction {
            id: "act_cancel".to_string(),
            kind: ActionKind::Cancel,
            effective_date: Some(date(2026, 4, 1)),
        }],
        items: vec![ProviderItem {
            current_period_start: Some(provider_date_start(date(2026, 3, 1))),
            current_period_end: Some(provider_date_start(date(2026, 4, 1))),
            price_id: Some("plan_plus".to_string()),
        }],
        ..ProviderSubscription::default()
    });

    let first = world.service.reconcile("sq_y").await.unwrap();
    let after_first = world.db.snapshot().subscriptions.clone();
    let second = world.service.reconcile("sq_y").await.unwrap();
    let after_second = world.db.snapshot().subscriptions.clone();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&after_first).unwrap(),
        serde_json::to_vec(&after_second).unwrap()
    );
    assert!(first.cancel_at_period_end);
    assert_eq!(first.price_id.as_deref(), Some("plan_plus"));
    assert!(world.db.snapshot().stores[&store_id].subscription_active);
}

#[tokio::test]
async fn periodic_reconcile_applies_a_reached_pause() {
    let world = World::new();
    let (store_id, _) = seed_subscription(&world, "sq_z");
    world.provider.insert(ProviderSubscription {
        id: "sq_z".to_string(),
        status: "ACTIVE".to_string(),
        charged_through_date: Some(date(2026, 3, 1)),
        actions: vec![ProviderAction {
            id: "act_pause".to_string(),
            kind: ActionKind::Pause,
            effective_date: Some(date(2026, 3, 1)),
        }],
        ..ProviderSubscription::default()
    });

    world.cycle().await;

    let snap = world.db.snapshot();
    assert!(!snap.stores[&store_id].subscription_active);
    assert_eq!(
        snap.subscriptions[0].pause_effective_at,
        Some(provider_date_start(date(2026, 3, 1)))
    );
    assert_eq!(world.metrics.snapshot("subscription_reconcile").succeeded, 1);
}
