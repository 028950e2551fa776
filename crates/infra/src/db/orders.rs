use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use bazaar_core::{CheckoutGroupId, LineItemId, OrderId, ProductId, StoreId};
use bazaar_orders::{LineItem, LineItemStatus, VendorOrder, VendorOrderStatus};

use super::{PgTx, PostgresStore, map_sqlx_error, parse_tag};
use crate::error::{ServiceError, ServiceResult};
use crate::repositories::{InventoryRepository, NotificationsRepository, OrdersRepository};

const ORDER_COLUMNS: &str = "id, checkout_group_id, buyer_store_id, vendor_store_id, status, \
     balance_due_cents, created_at, expired_at";

fn order_from_row(row: &PgRow) -> ServiceResult<VendorOrder> {
    let status: String = row.try_get("status")?;
    Ok(VendorOrder {
        id: OrderId::from_uuid(row.try_get("id")?),
        checkout_group_id: CheckoutGroupId::from_uuid(row.try_get("checkout_group_id")?),
        buyer_store_id: StoreId::from_uuid(row.try_get("buyer_store_id")?),
        vendor_store_id: StoreId::from_uuid(row.try_get("vendor_store_id")?),
        status: parse_tag::<VendorOrderStatus>("vendor_orders.status", &status)?,
        balance_due_cents: row.try_get("balance_due_cents")?,
        created_at: row.try_get("created_at")?,
        expired_at: row.try_get("expired_at")?,
        line_items: Vec::new(),
    })
}

fn line_from_row(row: &PgRow) -> ServiceResult<(Uuid, LineItem)> {
    let status: String = row.try_get("status")?;
    Ok((
        row.try_get("order_id")?,
        LineItem {
            id: LineItemId::from_uuid(row.try_get("id")?),
            product_id: ProductId::from_uuid(row.try_get("product_id")?),
            quantity: row.try_get("quantity")?,
            status: parse_tag::<LineItemStatus>("vendor_order_line_items.status", &status)?,
        },
    ))
}

const LINE_QUERY: &str = r#"
    SELECT id, order_id, product_id, quantity, status
    FROM vendor_order_line_items
    WHERE order_id = ANY($1)
    ORDER BY position ASC, id ASC
"#;

/// Attach line items to their orders, keeping line order stable.
fn attach_lines(orders: &mut [VendorOrder], lines: Vec<(Uuid, LineItem)>) {
    let mut by_order: HashMap<Uuid, Vec<LineItem>> = HashMap::new();
    for (order_id, line) in lines {
        by_order.entry(order_id).or_default().push(line);
    }
    for order in orders {
        order.line_items = by_order.remove(order.id.as_uuid()).unwrap_or_default();
    }
}

#[async_trait]
impl OrdersRepository<PgTx> for PostgresStore {
    async fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ServiceResult<Vec<VendorOrder>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM vendor_orders
            WHERE status = 'created_pending' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("orders_find_pending_created_before", e))?;

        let mut orders = rows.iter().map(order_from_row).collect::<ServiceResult<Vec<_>>>()?;
        if orders.is_empty() {
            return Ok(orders);
        }

        let ids: Vec<Uuid> = orders.iter().map(|o| *o.id.as_uuid()).collect();
        let line_rows = sqlx::query(LINE_QUERY)
            .bind(&ids)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("orders_load_lines", e))?;
        let lines = line_rows.iter().map(line_from_row).collect::<ServiceResult<Vec<_>>>()?;
        attach_lines(&mut orders, lines);
        Ok(orders)
    }

    async fn lock_for_update(&self, tx: &mut PgTx, id: OrderId) -> ServiceResult<Option<VendorOrder>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM vendor_orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("orders_lock_for_update", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut order = order_from_row(&row)?;

        let line_rows = sqlx::query(&format!("{LINE_QUERY} FOR UPDATE"))
            .bind(vec![*id.as_uuid()])
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("orders_lock_lines", e))?;
        let lines = line_rows.iter().map(line_from_row).collect::<ServiceResult<Vec<_>>>()?;
        attach_lines(std::slice::from_mut(&mut order), lines);
        Ok(Some(order))
    }

    async fn update(&self, tx: &mut PgTx, order: &VendorOrder) -> ServiceResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE vendor_orders
            SET status = $2, balance_due_cents = $3, expired_at = $4
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.balance_due_cents)
        .bind(order.expired_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("orders_update", e))?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("order {}", order.id)));
        }

        for line in &order.line_items {
            sqlx::query("UPDATE vendor_order_line_items SET status = $2 WHERE id = $1")
                .bind(line.id.as_uuid())
                .bind(line.status.as_str())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("orders_update_line", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository<PgTx> for PostgresStore {
    async fn release_reservation(
        &self,
        tx: &mut PgTx,
        product_id: ProductId,
        quantity: i64,
    ) -> ServiceResult<()> {
        sqlx::query(
            r#"
            UPDATE inventory_reservations
            SET reserved_quantity = GREATEST(reserved_quantity - $2, 0)
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(quantity)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("inventory_release_reservation", e))?;
        Ok(())
    }
}

#[async_trait]
impl NotificationsRepository<PgTx> for PostgresStore {
    async fn delete_created_before(&self, tx: &mut PgTx, cutoff: DateTime<Utc>) -> ServiceResult<u64> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("notifications_delete_created_before", e))?;
        Ok(result.rows_affected())
    }
}
