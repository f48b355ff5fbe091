//! Multi-cloud storage abstraction.
//!
//! Provides a unified interface for working with S3, GCS, Azure Blob Storage,
//! the local filesystem and in-process memory buckets.

mod azure;
mod gcs;
mod local;
mod memory;
mod s3;
mod url_parser;

pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, RetryConfig};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{CopyMismatchSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use azure::AzureConfig;
pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

use crate::resource::StoragePoolRef;

/// Create a storage provider, using the pool if available.
pub async fn get_or_create_storage(
    pool: Option<&StoragePoolRef>,
    url: &str,
    options: HashMap<String, String>,
) -> Result<StorageProviderRef, StorageError> {
    match pool {
        Some(p) => p.get_or_create(url, options).await,
        None => Ok(Arc::new(
            StorageProvider::for_url_with_options(url, options).await?,
        )),
    }
}

/// Client-level retries for cloud backends. Step-level retries sit on top.
fn default_retry_config() -> RetryConfig {
    RetryConfig::default()
}

/// Storage provider that abstracts over different storage backends.
///
/// All paths passed in and returned are relative to the key prefix of the URL
/// the provider was opened on.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

/// Record the outcome and latency of one storage call.
fn record<T, E>(operation: StorageOperation, start: Instant, result: &Result<T, E>) {
    let status = if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options),
            BackendConfig::Azure(config) => Self::construct_azure(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Create a storage provider for the given URL with default options.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Create a provider on an existing client, with its own key prefix.
    pub(crate) fn with_shared_store(
        config: BackendConfig,
        object_store: Arc<dyn ObjectStore>,
        canonical_url: String,
        storage_options: HashMap<String, String>,
    ) -> Self {
        Self {
            config,
            object_store,
            canonical_url,
            storage_options,
        }
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    fn relative(&self, path: &Path) -> Path {
        let skip = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();
        path.parts().skip(skip).collect()
    }

    /// List every object whose relative key starts with `prefix`.
    ///
    /// A prefix ending in `/` (or empty) selects a directory. Otherwise the
    /// last segment is matched as a string prefix, so `input_data/logistics_`
    /// finds `input_data/logistics_2024-01-01.csv`. Results are sorted by key
    /// and carry keys relative to the provider root.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let (dir, partial) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (dir, rest),
            None => ("", prefix),
        };
        let dir = Path::from(dir);
        let qualified_dir = self.qualify_path(&dir);

        let start = Instant::now();
        let result: Result<Vec<ObjectMeta>, _> = self
            .object_store
            .list(Some(&qualified_dir))
            .try_collect()
            .await;
        record(StorageOperation::List, start, &result);

        let mut objects: Vec<ObjectMeta> = result
            .context(ObjectStoreSnafu)?
            .into_iter()
            .map(|mut meta| {
                meta.location = self.relative(&meta.location);
                meta
            })
            .filter(|meta| {
                partial.is_empty()
                    || meta
                        .location
                        .as_ref()
                        .strip_prefix(dir.as_ref())
                        .map(|rest| rest.trim_start_matches('/').starts_with(partial))
                        .unwrap_or(false)
            })
            .collect();

        objects.sort_by(|a, b| a.location.cmp(&b.location));
        debug!(
            location = %self.canonical_url,
            prefix,
            count = objects.len(),
            "Listed objects"
        );
        Ok(objects)
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = match self.object_store.get(&path).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        record(StorageOperation::Get, start, &result);
        result.context(ObjectStoreSnafu)
    }

    /// Fetch object metadata without its contents.
    pub async fn head(&self, path: &Path) -> Result<ObjectMeta, StorageError> {
        let qualified = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.head(&qualified).await;
        record(StorageOperation::Head, start, &result);
        let mut meta = result.context(ObjectStoreSnafu)?;
        meta.location = path.clone();
        Ok(meta)
    }

    /// Write an object, replacing any existing one.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.put_with_opts(path, PutPayload::from(bytes), PutOptions::default())
            .await
    }

    /// Write an object only if nothing exists at `path`.
    ///
    /// Losing the race returns an error for which
    /// [`StorageError::is_already_exists`] is true.
    pub async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.put_with_opts(path, PutPayload::from(bytes), opts)
            .await
    }

    async fn put_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record(StorageOperation::Put, start, &result);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete an object.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record(StorageOperation::Delete, start, &result);
        result.context(ObjectStoreSnafu)
    }

    /// Server-side rename within this provider.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from = self.qualify_path(from);
        let to = self.qualify_path(to);
        let start = Instant::now();
        let result = self.object_store.rename(&from, &to).await;
        record(StorageOperation::Rename, start, &result);
        result.context(ObjectStoreSnafu)
    }

    /// Atomically write content to a path using temp object + rename.
    ///
    /// Readers see either the previous content or the new content, never a
    /// partial write.
    pub async fn atomic_write(&self, path: &Path, content: Bytes) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put(&temp_path, content).await?;
        self.rename(&temp_path, path).await
    }

    /// True if both providers sit in the same bucket, so objects can be
    /// renamed between them server-side.
    pub fn shares_bucket_with(&self, other: &StorageProvider) -> bool {
        self.config.is_shareable() && self.config.bucket_url() == other.config.bucket_url()
    }

    /// Move `from` in this provider to `to` in `dest`.
    ///
    /// Within one bucket this is a server-side rename. Across buckets the
    /// object is copied, the copy's size is checked against the source and
    /// only then is the source deleted, so a failure never loses data.
    pub async fn move_to(
        &self,
        from: &Path,
        dest: &StorageProvider,
        to: &Path,
    ) -> Result<(), StorageError> {
        if self.shares_bucket_with(dest) {
            let from_q = self.qualify_path(from);
            let to_q = dest.qualify_path(to);
            let start = Instant::now();
            let result = self.object_store.rename(&from_q, &to_q).await;
            record(StorageOperation::Rename, start, &result);
            return result.context(ObjectStoreSnafu);
        }

        let bytes = self.get(from).await?;
        let expected = bytes.len() as u64;
        dest.put(to, bytes).await?;

        let copied = dest.head(to).await?;
        ensure!(
            copied.size == expected,
            CopyMismatchSnafu {
                path: to.to_string(),
                expected,
                actual: copied.size,
            }
        );

        self.delete(from).await
    }

    /// Storage options the provider was created with.
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Canonical URL of the provider root, for logs.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory(url: &str) -> StorageProvider {
        StorageProvider::for_url(url).await.unwrap()
    }

    #[tokio::test]
    async fn test_key_prefix_is_applied_and_stripped() {
        let bucket = memory("memory://storage-test-prefix").await;
        let scoped = memory("memory://storage-test-prefix/raw").await;

        scoped
            .put(&Path::from("input_data/a.csv"), Bytes::from_static(b"x,y\n"))
            .await
            .unwrap();

        let root_listing = bucket.list_with_prefix("raw/").await.unwrap();
        assert_eq!(root_listing[0].location.as_ref(), "raw/input_data/a.csv");

        let scoped_listing = scoped.list_with_prefix("input_data/").await.unwrap();
        assert_eq!(scoped_listing[0].location.as_ref(), "input_data/a.csv");
    }

    #[tokio::test]
    async fn test_list_with_partial_segment_prefix() {
        let store = memory("memory://storage-test-partial").await;
        for key in [
            "input_data/logistics_2024-01-01.csv",
            "input_data/logistics_2024-01-02.csv",
            "input_data/orders_2024-01-01.csv",
            "input_data_old/logistics_2023-12-31.csv",
        ] {
            store.put(&Path::from(key), Bytes::from_static(b"1")).await.unwrap();
        }

        let keys: Vec<String> = store
            .list_with_prefix("input_data/logistics_")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.location.to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "input_data/logistics_2024-01-01.csv",
                "input_data/logistics_2024-01-02.csv",
            ]
        );

        let dir = store.list_with_prefix("input_data/").await.unwrap();
        assert_eq!(dir.len(), 3);
    }

    #[tokio::test]
    async fn test_put_if_absent_conflicts() {
        let store = memory("memory://storage-test-create").await;
        let path = Path::from("_catalog/db.json");
        store
            .put_if_absent(&path, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let err = store
            .put_if_absent(&path, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = memory("memory://storage-test-missing").await;
        let err = store.get(&Path::from("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_move_within_bucket() {
        let raw = memory("memory://storage-test-same/raw").await;
        let archive = memory("memory://storage-test-same/archive").await;
        assert!(raw.shares_bucket_with(&archive));

        let key = Path::from("input_data/file.csv");
        raw.put(&key, Bytes::from_static(b"abc")).await.unwrap();
        raw.move_to(&key, &archive, &key).await.unwrap();

        assert!(raw.get(&key).await.unwrap_err().is_not_found());
        assert_eq!(archive.get(&key).await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_move_across_buckets() {
        let raw = memory("memory://storage-test-src").await;
        let archive = memory("memory://storage-test-dst").await;
        assert!(!raw.shares_bucket_with(&archive));

        let key = Path::from("input_data/file.csv");
        raw.put(&key, Bytes::from_static(b"abcdef")).await.unwrap();
        raw.move_to(&key, &archive, &key).await.unwrap();

        assert!(raw.list_with_prefix("input_data/").await.unwrap().is_empty());
        assert_eq!(archive.head(&key).await.unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_local_atomic_write_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let raw_dir = dir.path().join("raw");
        let archive_dir = dir.path().join("archive");
        let raw = StorageProvider::for_url(raw_dir.to_str().unwrap())
            .await
            .unwrap();
        let archive = StorageProvider::for_url(archive_dir.to_str().unwrap())
            .await
            .unwrap();
        assert!(!raw.shares_bucket_with(&archive));

        let key = Path::from("input_data/logistics.csv");
        raw.atomic_write(&key, Bytes::from_static(b"id\n1\n"))
            .await
            .unwrap();
        assert!(raw_dir.join("input_data/logistics.csv").exists());
        assert!(!raw_dir.join("input_data/logistics.csv.tmp").exists());

        raw.move_to(&key, &archive, &key).await.unwrap();
        assert!(archive_dir.join("input_data/logistics.csv").exists());
        assert!(raw.list_with_prefix("input_data/").await.unwrap().is_empty());
    }
}
