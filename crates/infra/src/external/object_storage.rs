//! Object storage contract used for best-effort purges.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{ServiceError, ServiceResult};

#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    async fn delete_object(&self, bucket: &str, key: &str) -> ServiceResult<()>;
}

/// Bucket/key set held in memory; records every delete it receives.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStorage {
    objects: Arc<Mutex<BTreeSet<(String, String)>>>,
    deletes: Arc<Mutex<Vec<(String, String)>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), key.to_string()));
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(bucket.to_string(), key.to_string()))
    }

    /// Every `(bucket, key)` passed to `delete_object`, in call order.
    pub fn deletes(&self) -> Vec<(String, String)> {
        self.deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent deletes fail with a dependency error.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(PoisonError::into_inner) = unavailable;
    }
}

#[async_trait]
impl ObjectStorageClient for InMemoryObjectStorage {
    async fn delete_object(&self, bucket: &str, key: &str) -> ServiceResult<()> {
        self.deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((bucket.to_string(), key.to_string()));
        if *self.unavailable.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ServiceError::dependency("object storage unavailable"));
        }
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
