//! Moving processed source objects to the archive.
//!
//! Objects keep their key and change namespace. A key that is already gone
//! from the source counts as archived when it is present at the destination,
//! which makes re-running an interrupted archive safe; a key found in neither
//! place fails the archive. Metadata objects (see [`is_data_object`]) stay in
//! the source. The archiver is only invoked after the load of the same run
//! committed.

use sleet_core::{RetryPolicy, retry_with_backoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, StorageError};
use crate::metrics::ObjectsArchived;
use crate::store::{ObjectStoreRef, is_data_object};

pub struct Archiver {
    store: ObjectStoreRef,
    retry: RetryPolicy,
    cancel: CancellationToken,
    pipeline: String,
}

impl Archiver {
    pub fn new(
        store: ObjectStoreRef,
        retry: RetryPolicy,
        cancel: CancellationToken,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            cancel,
            pipeline: pipeline.into(),
        }
    }

    /// Move every object under `prefix` in `namespace` to `destination`.
    pub async fn archive_processed(
        &self,
        namespace: &str,
        prefix: &str,
        destination: &str,
    ) -> Result<Vec<String>, ArchiveError> {
        let objects = self
            .store
            .list(namespace, prefix)
            .await
            .map_err(|source| ArchiveError::ArchiveList {
                namespace: namespace.to_string(),
                prefix: prefix.to_string(),
                source,
            })?;
        let keys: Vec<String> = objects
            .into_iter()
            .map(|o| o.key)
            .filter(|key| is_data_object(key))
            .collect();

        self.archive_objects(namespace, &keys, destination).await
    }

    /// Move exactly `keys` from `namespace` to `destination`, in order.
    ///
    /// Returns the keys that are now archived. If a move fails after others
    /// succeeded the error lists what was moved.
    pub async fn archive_objects(
        &self,
        namespace: &str,
        keys: &[String],
        destination: &str,
    ) -> Result<Vec<String>, ArchiveError> {
        let mut moved = Vec::with_capacity(keys.len());

        for key in keys {
            let result = match self.move_one(namespace, key, destination).await {
                Err(e) if e.is_not_found() => self.confirm_archived(key, destination, e).await,
                other => other,
            };
            match result {
                Ok(()) => moved.push(key.clone()),
                Err(source) => {
                    warn!(
                        target = %self.pipeline,
                        key,
                        moved = moved.len(),
                        error = %source,
                        "Archive interrupted"
                    );
                    self.record(moved.len());
                    return Err(if moved.is_empty() {
                        ArchiveError::Move {
                            key: key.clone(),
                            source,
                        }
                    } else {
                        ArchiveError::ArchivePartial {
                            moved,
                            failed_key: key.clone(),
                            source,
                        }
                    });
                }
            }
        }

        self.record(moved.len());
        info!(
            target = %self.pipeline,
            namespace,
            destination,
            objects = moved.len(),
            "Archived source objects"
        );
        Ok(moved)
    }

    async fn move_one(
        &self,
        namespace: &str,
        key: &str,
        destination: &str,
    ) -> Result<(), StorageError> {
        let store = &self.store;
        retry_with_backoff(
            &self.retry,
            &self.cancel,
            "archive",
            StorageError::is_transient,
            || store.move_object(namespace, key, destination),
        )
        .await
    }

    /// A key missing from the source is archived only if the destination has it.
    async fn confirm_archived(
        &self,
        key: &str,
        destination: &str,
        missing: StorageError,
    ) -> Result<(), StorageError> {
        if self.store.exists(destination, key).await? {
            debug!(target = %self.pipeline, key, "Already archived");
            Ok(())
        } else {
            Err(missing)
        }
    }

    fn record(&self, count: usize) {
        if count > 0 {
            sleet_core::emit!(ObjectsArchived {
                pipeline: self.pipeline.clone(),
                count: count as u64,
            });
        }
    }
}
