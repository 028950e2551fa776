//! Postgres adapters.
//!
//! [`PostgresStore`] implements every repository contract plus the outbox
//! over one connection pool. Writes run on a [`PgTx`] handed out by the
//! [`TxBackend`] impl; row locks are `SELECT ... FOR UPDATE` on that
//! transaction.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | ServiceError |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `StateConflict` |
//! | Database (check violation) | `23514` | `Validation` |
//! | RowNotFound | N/A | `NotFound` |
//! | anything else | any | `Dependency` |

mod billing;
mod licensing;
mod media;
mod orders;
mod outbox;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use crate::error::{ServiceError, ServiceResult};
use crate::tx::TxBackend;

/// Transaction handle used by every Postgres repository method.
pub type PgTx = Transaction<'static, Postgres>;

const SCHEMA: &str = include_str!("../../migrations/0001_core.sql");

/// Pool-backed implementation of the core's storage contracts.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn run_migrations(&self) -> ServiceResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("run_migrations", e))?;
        Ok(())
    }
}

#[async_trait]
impl TxBackend<PgTx> for PostgresStore {
    async fn begin(&self) -> ServiceResult<PgTx> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: PgTx) -> ServiceResult<()> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: PgTx) -> ServiceResult<()> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map a SQLx error onto the service error kinds.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ServiceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => ServiceError::StateConflict(msg),
                Some("23514") => ServiceError::Validation(msg),
                _ => ServiceError::Dependency(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            ServiceError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            ServiceError::Dependency(format!("connection pool closed in {}", operation))
        }
        other => ServiceError::Dependency(format!("sqlx error in {}: {}", operation, other)),
    }
}

/// Decode a stored tag column, treating unknown values as corrupt data.
pub(crate) fn parse_tag<T>(column: &str, raw: &str) -> ServiceResult<T>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ServiceError::fatal(format!("column {column}: {e}")))
}

/// Counts are stored as INTEGER; negative values never occur.
pub(crate) fn to_count(raw: i32) -> u32 {
    u32::try_from(raw).unwrap_or_default()
}
