//! Object store interface used by the detector and the archiver.
//!
//! Namespaces are storage URLs (`s3://raw-bucket`, `memory://raw`,
//! `/data/raw`); keys are paths relative to them. [`PooledObjectStore`]
//! implements the trait over `sleet_core` storage providers, bounding every
//! call with a deadline so a hung backend surfaces as a transient error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use sleet_core::{StoragePool, StoragePoolRef, StorageProviderRef};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;

/// A source object as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Whether `key` names a data object.
///
/// Directory markers (`dir/`) and files whose name starts with `_` or `.`
/// (`_SUCCESS`, `.part-0.csv`) are metadata. They never count as an arrival,
/// are never loaded and stay in place when the prefix is archived.
pub fn is_data_object(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    !name.is_empty() && !name.starts_with('_') && !name.starts_with('.')
}

/// Listing and moving objects between namespaces.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `namespace` whose key starts with `prefix`, sorted.
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Whether `key` exists under `namespace`.
    async fn exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// Move `key` from `namespace` to the same key under `dest_namespace`.
    ///
    /// After success the object exists only at the destination.
    async fn move_object(
        &self,
        namespace: &str,
        key: &str,
        dest_namespace: &str,
    ) -> Result<(), StorageError>;
}

/// A reference-counted object store.
pub type ObjectStoreRef = Arc<dyn ObjectStore>;

/// [`ObjectStore`] over pooled storage providers.
pub struct PooledObjectStore {
    pool: StoragePoolRef,
    storage_options: HashMap<String, String>,
    call_timeout: Duration,
}

impl PooledObjectStore {
    /// Use the shared pool when connection pooling is enabled, otherwise a
    /// private one so providers are still reused within this pipeline.
    pub fn new(
        pool: Option<StoragePoolRef>,
        storage_options: HashMap<String, String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            pool: pool.unwrap_or_else(|| Arc::new(StoragePool::new())),
            storage_options,
            call_timeout,
        }
    }

    async fn provider(&self, namespace: &str) -> Result<StorageProviderRef, StorageError> {
        self.pool
            .get_or_create(namespace, self.storage_options.clone())
            .await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::TimedOut {
                operation: operation.to_string(),
                secs: self.call_timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for PooledObjectStore {
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let provider = self.provider(namespace).await?;
        let objects = self
            .bounded("list", provider.list_with_prefix(prefix))
            .await?;
        Ok(objects
            .into_iter()
            .map(|meta| ObjectMeta {
                key: meta.location.to_string(),
                size: meta.size,
                last_modified: meta.last_modified,
            })
            .collect())
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let provider = self.provider(namespace).await?;
        match self.bounded("head", provider.head(&Path::from(key))).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn move_object(
        &self,
        namespace: &str,
        key: &str,
        dest_namespace: &str,
    ) -> Result<(), StorageError> {
        let source = self.provider(namespace).await?;
        let dest = self.provider(dest_namespace).await?;
        let path = Path::from(key);
        self.bounded("move", source.move_to(&path, &dest, &path))
            .await
    }
}
