//! Transaction runner.
//!
//! Every multi-row side effect in the core is framed by one
//! [`TxRunner::with_tx`] call so business writes and outbox emits commit or
//! fail together. The transaction handle is passed explicitly to every
//! repository method that writes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{error, warn};

use crate::error::ServiceResult;

/// Opens, commits and rolls back transactions of type `Tx`.
#[async_trait]
pub trait TxBackend<Tx: Send>: Send + Sync {
    async fn begin(&self) -> ServiceResult<Tx>;
    async fn commit(&self, tx: Tx) -> ServiceResult<()>;
    async fn rollback(&self, tx: Tx) -> ServiceResult<()>;
}

/// Runs closures inside a transaction.
pub struct TxRunner<Tx> {
    backend: Arc<dyn TxBackend<Tx>>,
}

impl<Tx> Clone for TxRunner<Tx> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<Tx: Send + 'static> TxRunner<Tx> {
    pub fn new(backend: Arc<dyn TxBackend<Tx>>) -> Self {
        Self { backend }
    }

    /// Run `f` in a fresh transaction.
    ///
    /// Commits iff `f` returns `Ok`. Rolls back on `Err` and on panic; a
    /// panic is re-raised after the rollback. Rollback failures are logged
    /// and the original error is returned.
    pub async fn with_tx<T, F>(&self, f: F) -> ServiceResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, ServiceResult<T>> + Send,
    {
        let mut tx = self.backend.begin().await?;

        let outcome = AssertUnwindSafe(f(&mut tx)).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                self.backend.commit(tx).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = self.backend.rollback(tx).await {
                    warn!(error = %rollback_err, "rollback after error failed");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(rollback_err) = self.backend.rollback(tx).await {
                    error!(error = %rollback_err, "rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}
