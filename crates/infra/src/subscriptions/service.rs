//! Subscription reconciler.
//!
//! Every local write follows a provider round trip and happens under a row
//! lock on the local subscription, so the row never reflects a provider
//! state older than the one the triggering call observed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bazaar_billing::{
    BillingProvider, CreateSubscriptionParams, PauseParams, ProviderSubscription, ResumeParams,
    Subscription, SubscriptionStatus, SubscriptionStatusChanged, apply_pending_actions,
    derive_entitlement_active, is_active_status, pause_effective_date, provider_date_start,
    update_subscription_from_provider,
};
use bazaar_core::{Clock, StoreId};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::outbox::emit_event;
use crate::repositories::{BillingTx, Repositories};

/// Metadata key linking a provider subscription back to its store.
pub const STORE_ID_METADATA_KEY: &str = "store_id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSubscriptionInput {
    pub customer_id: String,
    pub payment_method_id: String,
    /// Falls back to the configured default price.
    pub price_id: Option<String>,
    pub location_id: Option<String>,
}

type Mutator = Box<dyn FnOnce(&mut Subscription) + Send>;

enum RowLookup {
    External(String),
    ActiveForStore(StoreId),
}

impl fmt::Display for RowLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowLookup::External(id) => write!(f, "subscription {id}"),
            RowLookup::ActiveForStore(store_id) => {
                write!(f, "active subscription for store {store_id}")
            }
        }
    }
}

/// How the store's entitlement flag is computed after a write.
#[derive(Clone, Copy)]
enum Entitlement {
    FromStatus,
    Derived,
    Fixed(bool),
}

enum CreateOutcome {
    Created(Subscription),
    Existing(Subscription),
}

pub struct SubscriptionService<Tx> {
    repos: Repositories<Tx>,
    provider: Arc<dyn BillingProvider>,
    clock: Clock,
    default_price_id: String,
    location_id: Option<String>,
}

impl<Tx: Send + 'static> SubscriptionService<Tx> {
    pub fn new(
        repos: Repositories<Tx>,
        provider: Arc<dyn BillingProvider>,
        default_price_id: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            repos,
            provider,
            clock,
            default_price_id: default_price_id.into(),
            location_id: None,
        }
    }

    pub fn with_location(mut self, location_id: Option<String>) -> Self {
        self.location_id = location_id;
        self
    }

    /// Create a provider subscription for the store and mirror it locally.
    ///
    /// Returns the store's existing active subscription with `false` when
    /// there already is one.
    #[instrument(skip(self, input))]
    pub async fn create(
        &self,
        store_id: StoreId,
        input: CreateSubscriptionInput,
    ) -> ServiceResult<(Subscription, bool)> {
        if input.customer_id.trim().is_empty() {
            return Err(ServiceError::validation("customer id is required"));
        }
        if input.payment_method_id.trim().is_empty() {
            return Err(ServiceError::validation("payment method id is required"));
        }
        let price_id = input
            .price_id
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_price_id.clone());
        if price_id.trim().is_empty() {
            return Err(ServiceError::validation("price id is required"));
        }

        if let Some(existing) = self.repos.billing.find_active_subscription(store_id).await? {
            return Ok((existing, false));
        }

        let metadata =
            BTreeMap::from([(STORE_ID_METADATA_KEY.to_string(), store_id.to_string())]);
        let params = CreateSubscriptionParams {
            idempotency_key: Uuid::new_v4().to_string(),
            location_id: input.location_id.or_else(|| self.location_id.clone()),
            customer_id: input.customer_id,
            payment_method_id: input.payment_method_id,
            price_id,
            metadata: metadata.clone(),
        };
        let created = self.provider.create(params).await?;

        let snapshot = match self.provider.get(&created.id, true).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.cancel_orphan(&created.id).await;
                return Err(err.into());
            }
        };

        let external_id = created.id;
        let outcome = self
            .insert_from_provider(store_id, external_id.clone(), snapshot, metadata)
            .await;

        match outcome {
            Ok(CreateOutcome::Created(sub)) => {
                info!(subscription_id = %sub.id, external_id = %external_id, "subscription created");
                Ok((sub, true))
            }
            Ok(CreateOutcome::Existing(sub)) => {
                info!(external_id = %external_id, "store gained a subscription concurrently");
                self.cancel_orphan(&external_id).await;
                Ok((sub, false))
            }
            Err(err) => {
                self.cancel_orphan(&external_id).await;
                Err(err)
            }
        }
    }

    async fn insert_from_provider(
        &self,
        store_id: StoreId,
        external_id: String,
        snapshot: ProviderSubscription,
        metadata: BTreeMap<String, String>,
    ) -> ServiceResult<CreateOutcome> {
        let repos = self.repos.clone();
        let now = self.clock.now();
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    let mut billing = BillingTx::new(&*repos.billing, tx);
                    if let Some(existing) = billing.lock_active_for_store(store_id).await? {
                        return Ok(CreateOutcome::Existing(existing));
                    }

                    let mut sub = Subscription::new(store_id, external_id, now);
                    update_subscription_from_provider(&mut sub, &snapshot);
                    apply_pending_actions(&mut sub, &snapshot);
                    for (key, value) in metadata {
                        sub.metadata.entry(key).or_insert(value);
                    }
                    billing.create(&sub).await?;

                    let active = is_active_status(sub.status);
                    let tx = billing.tx();
                    repos
                        .stores
                        .update_subscription_active(tx, store_id, active)
                        .await?;
                    record_status_change(&repos, tx, &sub, None, active, now).await?;
                    Ok::<_, ServiceError>(CreateOutcome::Created(sub))
                })
            })
            .await
    }

    /// Cancel the store's active subscription at period end.
    #[instrument(skip(self))]
    pub async fn cancel(&self, store_id: StoreId) -> ServiceResult<Option<Subscription>> {
        let Some(active) = self.repos.billing.find_active_subscription(store_id).await? else {
            let stores = Arc::clone(&self.repos.stores);
            self.repos
                .tx
                .with_tx(move |tx| {
                    Box::pin(async move {
                        stores.update_subscription_active(tx, store_id, false).await
                    })
                })
                .await?;
            return Ok(None);
        };

        let external_id = active.external_subscription_id;
        let snapshot = match self.provider.cancel(&external_id).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_pending_cancel() => {
                info!(external_id = %external_id, "cancel already scheduled; syncing");
                return self.reconcile(&external_id).await.map(Some);
            }
            Err(err) => return Err(err.into()),
        };

        self.persist_provider_update(
            RowLookup::ActiveForStore(store_id),
            snapshot,
            None,
            Entitlement::Fixed(false),
        )
        .await
        .map(Some)
    }

    /// Schedule a pause at the end of the paid period.
    #[instrument(skip(self))]
    pub async fn pause(&self, store_id: StoreId) -> ServiceResult<Subscription> {
        let sub = self
            .repos
            .billing
            .find_subscription(store_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("subscription for store {store_id}")))?;
        let external_id = required_external_id(&sub)?;

        let live = self.provider.get(&external_id, true).await?;
        if !live.is_live_active() {
            return Err(ServiceError::conflict(format!(
                "provider subscription {external_id} is {}, not ACTIVE",
                live.status
            )));
        }

        let now = self.clock.now();
        let effective = pause_effective_date(now, &live, &sub);
        let params = PauseParams {
            price_id: sub.price_id.clone(),
            pause_effective_date: effective,
        };
        let snapshot = match self.provider.pause(&external_id, params).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_pending_pause() => {
                info!(external_id = %external_id, "pause already scheduled; syncing");
                return self.reconcile(&external_id).await;
            }
            Err(err) => return Err(err.into()),
        };

        let mark_paused: Mutator = Box::new(move |sub: &mut Subscription| {
            sub.status = SubscriptionStatus::Paused;
            sub.paused_at = Some(now);
            sub.pause_effective_at = Some(provider_date_start(effective));
        });
        self.persist_provider_update(
            RowLookup::External(external_id),
            snapshot,
            Some(mark_paused),
            Entitlement::FromStatus,
        )
        .await
    }

    /// Undo a scheduled pause, or resume a paused subscription.
    #[instrument(skip(self))]
    pub async fn resume(&self, store_id: StoreId) -> ServiceResult<Subscription> {
        let sub = self
            .repos
            .billing
            .find_subscription(store_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("subscription for store {store_id}")))?;
        let external_id = required_external_id(&sub)?;

        let live = self.provider.get(&external_id, true).await?;
        let clear_pause: Mutator = Box::new(|sub: &mut Subscription| {
            sub.paused_at = None;
            sub.pause_effective_at = None;
        });

        if live.is_live_active() {
            if let Some(action) = live.pending_pause() {
                let snapshot = self.provider.delete_action(&external_id, &action.id).await?;
                info!(external_id = %external_id, action_id = %action.id, "scheduled pause removed");
                return self
                    .persist_provider_update(
                        RowLookup::External(external_id),
                        snapshot,
                        Some(clear_pause),
                        Entitlement::FromStatus,
                    )
                    .await;
            }
        }

        if sub.status != SubscriptionStatus::Paused {
            return Err(ServiceError::conflict(format!(
                "subscription {} is {}, not paused",
                sub.id, sub.status
            )));
        }

        let params = ResumeParams {
            price_id: sub.price_id.clone(),
        };
        let snapshot = self.provider.resume(&external_id, params).await?;
        self.persist_provider_update(
            RowLookup::External(external_id),
            snapshot,
            Some(clear_pause),
            Entitlement::FromStatus,
        )
        .await
    }

    /// The store's active subscription, refreshed from the provider when
    /// possible.
    #[instrument(skip(self))]
    pub async fn get_active(&self, store_id: StoreId) -> ServiceResult<Option<Subscription>> {
        let Some(sub) = self.repos.billing.find_active_subscription(store_id).await? else {
            return Ok(None);
        };
        match self.reconcile(&sub.external_subscription_id).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(err) => {
                warn!(
                    external_id = %sub.external_subscription_id,
                    error = %err,
                    "subscription sync failed; returning stored row"
                );
                Ok(Some(sub))
            }
        }
    }

    /// Pull the provider's view of one subscription into the local row and
    /// the store's entitlement flag.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, external_id: &str) -> ServiceResult<Subscription> {
        let snapshot = self.provider.get(external_id, true).await?;
        self.persist_provider_update(
            RowLookup::External(external_id.to_string()),
            snapshot,
            None,
            Entitlement::Derived,
        )
        .await
    }

    async fn persist_provider_update(
        &self,
        lookup: RowLookup,
        snapshot: ProviderSubscription,
        mutate: Option<Mutator>,
        entitlement: Entitlement,
    ) -> ServiceResult<Subscription> {
        let repos = self.repos.clone();
        let now = self.clock.now();
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    let mut billing = BillingTx::new(&*repos.billing, tx);
                    let locked = match &lookup {
                        RowLookup::External(id) => billing.lock_by_external_id(id).await?,
                        RowLookup::ActiveForStore(store_id) => {
                            billing.lock_active_for_store(*store_id).await?
                        }
                    };
                    let mut sub =
                        locked.ok_or_else(|| ServiceError::not_found(lookup.to_string()))?;

                    let previous = sub.status;
                    update_subscription_from_provider(&mut sub, &snapshot);
                    apply_pending_actions(&mut sub, &snapshot);
                    if let Some(mutate) = mutate {
                        mutate(&mut sub);
                    }
                    billing.update(&sub).await?;

                    let active = match entitlement {
                        Entitlement::FromStatus => is_active_status(sub.status),
                        Entitlement::Derived => {
                            derive_entitlement_active(now, Some(&snapshot), Some(&sub))
                        }
                        Entitlement::Fixed(value) => value,
                    };
                    let tx = billing.tx();
                    repos
                        .stores
                        .update_subscription_active(tx, sub.store_id, active)
                        .await?;
                    if previous != sub.status {
                        record_status_change(&repos, tx, &sub, Some(previous), active, now)
                            .await?;
                    }
                    Ok::<_, ServiceError>(sub)
                })
            })
            .await
    }

    async fn cancel_orphan(&self, external_id: &str) {
        if let Err(err) = self.provider.cancel(external_id).await {
            warn!(
                external_id = %external_id,
                error = %err,
                "failed to cancel orphaned provider subscription"
            );
        }
    }
}

fn required_external_id(sub: &Subscription) -> ServiceResult<String> {
    let id = sub.external_subscription_id.trim();
    if id.is_empty() {
        return Err(ServiceError::validation(format!(
            "subscription {} has no provider id",
            sub.id
        )));
    }
    Ok(id.to_string())
}

async fn record_status_change<Tx: Send>(
    repos: &Repositories<Tx>,
    tx: &mut Tx,
    sub: &Subscription,
    previous: Option<SubscriptionStatus>,
    entitlement_active: bool,
    now: chrono::DateTime<chrono::Utc>,
) -> ServiceResult<()> {
    let event = SubscriptionStatusChanged {
        subscription_id: sub.id,
        store_id: sub.store_id,
        external_subscription_id: sub.external_subscription_id.clone(),
        previous_status: previous,
        new_status: sub.status,
        entitlement_active,
        changed_at: now,
    };
    emit_event(&*repos.outbox, tx, &event).await?;
    Ok(())
}
