//! Postgres-backed order store.
//!
//! Schema: see `migrations/0001_create_orders.sql` (applied by external
//! migration tooling).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! `OrderStore` is synchronous; the async queries run on the runtime whose
//! handle is passed to `new`. Call the trait methods from plain threads
//! (worker pool, `spawn_blocking`), never from inside an async task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use orderflow_core::{LineItem, NewOrder, Order, OrderId, OrderStatus, OwnerId};

use super::{OrderStore, StoreError};

/// Postgres-backed order store.
///
/// ## Conditional Update
///
/// `compare_and_set_status` is a single statement
/// (`UPDATE orders SET status = $3 WHERE id = $1 AND status = $2`), so the
/// read-modify-write is atomic without explicit locking.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self, order), fields(owner_id = %order.owner_id()), err)]
    pub async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let order = order.into_order(OrderId::new(), Utc::now());

        // The stored row is returned, not `order`: NUMERIC and TIMESTAMPTZ
        // round the amount and the creation time.
        let row = sqlx::query(
            r#"
            INSERT INTO orders (id, owner_id, line_items, total_amount, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, owner_id, line_items, total_amount, status, created_at
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.owner_id.as_uuid())
        .bind(Json(&order.line_items))
        .bind(order.total_amount)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e, Some(order.id)))?;

        decode_order(&row)
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn fetch_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, line_items, total_amount, status, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_order", e, None))?;

        row.as_ref().map(decode_order).transpose()
    }

    #[instrument(skip(self), fields(order_id = %id, %expected, %next), err)]
    pub async fn update_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status_if", e, None))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    pub async fn fetch_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, line_items, total_amount, status, created_at
            FROM orders
            WHERE owner_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(owner_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_owner", e, None))?;

        rows.iter().map(decode_order).collect()
    }
}

impl OrderStore for PostgresOrderStore {
    fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        self.runtime.block_on(self.insert_order(order))
    }

    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.runtime.block_on(self.fetch_order(id))
    }

    fn compare_and_set_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        self.runtime.block_on(self.update_status_if(id, expected, next))
    }

    fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError> {
        self.runtime.block_on(self.fetch_by_owner(owner_id))
    }
}

#[derive(Debug)]
struct OrderRow {
    id: uuid::Uuid,
    owner_id: uuid::Uuid,
    line_items: Json<Vec<LineItem>>,
    total_amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
}

impl OrderRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        let decode = |e: sqlx::Error| map_sqlx_error("decode_order_row", e, None);
        Ok(OrderRow {
            id: row.try_get("id").map_err(decode)?,
            owner_id: row.try_get("owner_id").map_err(decode)?,
            line_items: row.try_get("line_items").map_err(decode)?,
            total_amount: row.try_get("total_amount").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
        })
    }
}

fn decode_order(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
    OrderRow::from_pg_row(row)?.try_into()
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        // Unknown status strings are rejected at the store boundary.
        let status: OrderStatus = row
            .status
            .parse()
            .map_err(|_| StoreError::InvalidStatus(row.status.clone()))?;

        Ok(Order {
            id: OrderId::from_uuid(row.id),
            owner_id: OwnerId::from_uuid(row.owner_id),
            line_items: row.line_items.0,
            total_amount: row.total_amount,
            status,
            created_at: row.created_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error, id: Option<OrderId>) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if let (Some(code), Some(id)) = (db_err.code(), id) {
                if code.as_ref() == "23505" {
                    return StoreError::AlreadyExists(id);
                }
            }
            StoreError::Storage(format!(
                "database error in {}: {}",
                operation,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            StoreError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
