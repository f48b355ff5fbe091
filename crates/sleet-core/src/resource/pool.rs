//! Connection pooling for storage providers.
//!
//! Pipelines that read and write the same bucket share one client. Each
//! provider keeps its own key prefix on top of the shared client.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use object_store::ObjectStore;

use crate::error::StorageError;
use crate::storage::BackendConfig;
use crate::{StorageProvider, StorageProviderRef};

/// Reference-counted handle to a [`StoragePool`].
pub type StoragePoolRef = Arc<StoragePool>;

/// Pool of storage clients keyed by bucket URL, plus providers keyed by full URL.
#[derive(Default)]
pub struct StoragePool {
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
    providers: RwLock<HashMap<String, StorageProviderRef>>,
}

impl std::fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePool").finish_non_exhaustive()
    }
}

impl StoragePool {
    /// Create a new empty storage pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a storage provider for the given URL.
    pub async fn get_or_create(
        &self,
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<StorageProviderRef, StorageError> {
        let provider_key = url.trim_end_matches('/').to_string();

        if let Some(provider) = self.providers.read().await.get(&provider_key) {
            return Ok(provider.clone());
        }

        let config = BackendConfig::parse_url(url)?;
        let provider = if config.is_shareable() {
            let store = self.shared_store(&config, &options).await?;
            Arc::new(StorageProvider::with_shared_store(
                config,
                store,
                url.to_string(),
                options,
            ))
        } else {
            Arc::new(StorageProvider::for_url_with_options(url, options).await?)
        };

        // A concurrent caller may have won; keep whichever landed first.
        let mut providers = self.providers.write().await;
        Ok(providers.entry(provider_key).or_insert(provider).clone())
    }

    async fn shared_store(
        &self,
        config: &BackendConfig,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let bucket_url = config.bucket_url();

        if let Some(store) = self.stores.read().await.get(&bucket_url) {
            return Ok(store.clone());
        }

        let root = StorageProvider::for_url_with_options(&bucket_url, options.clone()).await?;
        let mut stores = self.stores.write().await;
        Ok(stores
            .entry(bucket_url)
            .or_insert(root.object_store)
            .clone())
    }

    /// Number of cached clients.
    pub async fn store_count(&self) -> usize {
        self.stores.read().await.len()
    }

    /// Number of cached providers.
    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::path::Path;

    #[tokio::test]
    async fn test_pool_shares_client_per_bucket() {
        let pool = StoragePool::new();

        let raw = pool
            .get_or_create("memory://pool-test/raw", HashMap::new())
            .await
            .unwrap();
        let archive = pool
            .get_or_create("memory://pool-test/archive", HashMap::new())
            .await
            .unwrap();
        let other = pool
            .get_or_create("memory://pool-test-other", HashMap::new())
            .await
            .unwrap();

        assert_eq!(pool.store_count().await, 2);
        assert_eq!(pool.provider_count().await, 3);
        assert!(raw.shares_bucket_with(&archive));
        assert!(!raw.shares_bucket_with(&other));
    }

    #[tokio::test]
    async fn test_pool_returns_cached_provider() {
        let pool = StoragePool::new();
        let a = pool
            .get_or_create("memory://pool-test-cache/x/", HashMap::new())
            .await
            .unwrap();
        let b = pool
            .get_or_create("memory://pool-test-cache/x", HashMap::new())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_pooled_providers_keep_their_prefix() {
        let pool = StoragePool::new();
        let raw = pool
            .get_or_create("memory://pool-test-prefix/raw", HashMap::new())
            .await
            .unwrap();
        let root = pool
            .get_or_create("memory://pool-test-prefix", HashMap::new())
            .await
            .unwrap();

        raw.put(&Path::from("a.csv"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        let listed = root.list_with_prefix("raw/").await.unwrap();
        assert_eq!(listed[0].location.as_ref(), "raw/a.csv");
    }

    #[tokio::test]
    async fn test_local_paths_are_not_pooled() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePool::new();
        let a = dir.path().join("a");
        pool.get_or_create(a.to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(pool.store_count().await, 0);
        assert_eq!(pool.provider_count().await, 1);
    }
}
