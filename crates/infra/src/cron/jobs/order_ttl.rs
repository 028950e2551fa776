use std::sync::Arc;

use async_trait::async_trait;
use bazaar_core::{Clock, OrderId, days};
use bazaar_events::{AggregateType, EventType};
use bazaar_orders::{OrderExpired, OrderPendingNudge, VendorOrder};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OrdersConfig;
use crate::cron::{CronJob, ensure_live};
use crate::error::{ServiceError, ServiceResult};
use crate::outbox::emit_event;
use crate::repositories::Repositories;

pub const ORDER_TTL_JOB: &str = "order_ttl";

/// Nudges vendors about orders left pending and expires the ones nobody
/// acted on, returning their reserved stock.
pub struct OrderTtlJob<Tx> {
    repos: Repositories<Tx>,
    clock: Clock,
    settings: OrdersConfig,
}

impl<Tx: Send + 'static> OrderTtlJob<Tx> {
    pub fn new(repos: Repositories<Tx>, settings: OrdersConfig, clock: Clock) -> Self {
        Self {
            repos,
            clock,
            settings,
        }
    }

    async fn nudge_pending(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        let now = self.clock.now();
        let pending_days = self.settings.pending_nudge_days;
        let candidates = self
            .repos
            .orders
            .find_pending_created_before(now - days(pending_days))
            .await?;

        let mut errors = Vec::new();
        let mut emitted = 0usize;
        for order in &candidates {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            match self.nudge_one(order, pending_days, now).await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(order_id = %order.id, error = %err, "pending order nudge failed");
                    errors.push(err);
                }
            }
        }

        info!(candidates = candidates.len(), emitted, "pending order nudges");
        ServiceError::join(errors)
    }

    async fn nudge_one(
        &self,
        order: &VendorOrder,
        pending_days: u32,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        let already_nudged = self
            .repos
            .outbox
            .exists(
                EventType::OrderPendingNudge,
                AggregateType::VendorOrder,
                order.id.into(),
            )
            .await?;
        if already_nudged {
            return Ok(false);
        }

        let event = OrderPendingNudge {
            order_id: order.id,
            checkout_group_id: order.checkout_group_id,
            buyer_store_id: order.buyer_store_id,
            vendor_store_id: order.vendor_store_id,
            pending_days,
            occurred_at: now,
        };
        let outbox = Arc::clone(&self.repos.outbox);
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    emit_event(&*outbox, tx, &event).await?;
                    Ok::<_, ServiceError>(())
                })
            })
            .await?;
        Ok(true)
    }

    async fn expire_stale(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        let now = self.clock.now();
        let candidates = self
            .repos
            .orders
            .find_pending_created_before(now - days(self.settings.expiration_days))
            .await?;

        let mut errors = Vec::new();
        let mut expired = 0usize;
        for order in &candidates {
            if let Err(err) = ensure_live(ctx) {
                errors.push(err);
                break;
            }
            match self.expire_one(order.id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(order_id = %order.id, error = %err, "order expiration failed");
                    errors.push(err);
                }
            }
        }

        info!(candidates = candidates.len(), expired, "pending orders expired");
        ServiceError::join(errors)
    }

    /// Expire one order under its row lock. `Ok(false)` when it vanished or
    /// left the pending state since it was listed.
    async fn expire_one(&self, order_id: OrderId, now: DateTime<Utc>) -> ServiceResult<bool> {
        let repos = self.repos.clone();
        self.repos
            .tx
            .with_tx(move |tx| {
                Box::pin(async move {
                    let Some(mut order) = repos.orders.lock_for_update(tx, order_id).await? else {
                        return Ok(false);
                    };
                    if !order.is_pending() {
                        info!(
                            order_id = %order_id,
                            status = order.status.as_str(),
                            "order left pending before expiry; skipping"
                        );
                        return Ok(false);
                    }

                    let released = order.expire(now)?;
                    for reservation in &released {
                        repos
                            .inventory
                            .release_reservation(tx, reservation.product_id, reservation.quantity)
                            .await?;
                    }
                    repos.orders.update(tx, &order).await?;

                    let event = OrderExpired {
                        order_id: order.id,
                        checkout_group_id: order.checkout_group_id,
                        buyer_store_id: order.buyer_store_id,
                        vendor_store_id: order.vendor_store_id,
                        expired_at: now,
                    };
                    emit_event(&*repos.outbox, tx, &event).await?;
                    Ok::<_, ServiceError>(true)
                })
            })
            .await
    }
}

#[async_trait]
impl<Tx: Send + 'static> CronJob for OrderTtlJob<Tx> {
    fn name(&self) -> &str {
        ORDER_TTL_JOB
    }

    async fn run(&self, ctx: &CancellationToken) -> ServiceResult<()> {
        info!(job = ORDER_TTL_JOB, "starting");
        let mut errors = Vec::new();

        if let Err(err) = self.nudge_pending(ctx).await {
            errors.push(err);
        }
        if ensure_live(ctx).is_ok() {
            if let Err(err) = self.expire_stale(ctx).await {
                errors.push(err);
            }
        }

        let failures = errors.len();
        info!(job = ORDER_TTL_JOB, failures, "finished");
        ServiceError::join(errors)
    }
}
