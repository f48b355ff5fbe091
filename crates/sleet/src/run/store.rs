//! Persistence of run records and load manifests.
//!
//! Layout under the state URI:
//!
//! ```text
//! runs/{pipeline}/{run_id}.json             run record
//! manifests/{pipeline}/{run_id}.load.json   committed load outcome
//! ```
//!
//! Writes go through temp object + rename, so a reader never sees a partial
//! record. Every storage call is bounded by the store's call timeout; an
//! expired call is a transient [`StorageError::TimedOut`].

use bytes::Bytes;
use object_store::path::Path;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sleet_core::{StoragePoolRef, StorageProviderRef, get_or_create_storage};
use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::Run;
use crate::error::{DecodeSnafu, EncodeSnafu, RunStoreError, StorageError, StoreIoSnafu};
use crate::load::LoadOutcome;

const RUNS_DIR: &str = "runs";
const MANIFESTS_DIR: &str = "manifests";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Stores runs and load manifests as JSON documents.
#[derive(Clone)]
pub struct RunStore {
    storage: StorageProviderRef,
    call_timeout: Duration,
}

impl RunStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound each storage call by `call_timeout` instead of the default minute.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Open the store at `state_uri`.
    pub async fn open(
        state_uri: &str,
        pool: Option<&StoragePoolRef>,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let storage = get_or_create_storage(pool, state_uri, storage_options).await?;
        Ok(Self::new(storage))
    }

    fn run_path(pipeline: &str, run_id: &str) -> Path {
        Path::from(format!("{RUNS_DIR}/{pipeline}/{run_id}.json"))
    }

    fn manifest_path(pipeline: &str, run_id: &str) -> Path {
        Path::from(format!("{MANIFESTS_DIR}/{pipeline}/{run_id}.load.json"))
    }

    /// The run record, or `None` if the run was never persisted.
    pub async fn load(&self, pipeline: &str, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        self.read(&Self::run_path(pipeline, run_id)).await
    }

    pub async fn save(&self, run: &Run) -> Result<(), RunStoreError> {
        let path = Self::run_path(&run.pipeline, &run.id);
        self.write(&path, run).await?;
        debug!(target = %run.pipeline, run_id = %run.id, state = %run.state, "Saved run");
        Ok(())
    }

    /// The run with the most recent logical time.
    pub async fn latest(&self, pipeline: &str) -> Result<Option<Run>, RunStoreError> {
        let prefix = format!("{RUNS_DIR}/{pipeline}/");
        let objects = self
            .timed("list", self.storage.list_with_prefix(&prefix))
            .await
            .context(StoreIoSnafu {
                path: prefix.clone(),
            })?;

        // Run ids embed a fixed-width timestamp, so key order is time order.
        let latest = objects
            .iter()
            .map(|meta| meta.location.as_ref())
            .filter(|key| key.ends_with(".json"))
            .max();

        match latest {
            Some(key) => self.read(&Path::from(key)).await,
            None => Ok(None),
        }
    }

    pub async fn load_manifest(
        &self,
        pipeline: &str,
        run_id: &str,
    ) -> Result<Option<LoadOutcome>, RunStoreError> {
        self.read(&Self::manifest_path(pipeline, run_id)).await
    }

    pub async fn save_manifest(
        &self,
        pipeline: &str,
        run_id: &str,
        outcome: &LoadOutcome,
    ) -> Result<(), RunStoreError> {
        self.write(&Self::manifest_path(pipeline, run_id), outcome)
            .await
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, RunStoreError> {
        let bytes = match self.timed("get", self.storage.get(path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(RunStoreError::StoreIo {
                    path: path.to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .context(DecodeSnafu {
                path: path.to_string(),
            })
    }

    async fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), RunStoreError> {
        let json = serde_json::to_vec_pretty(value).context(EncodeSnafu {
            path: path.to_string(),
        })?;
        self.timed("write", self.storage.atomic_write(path, Bytes::from(json)))
            .await
            .context(StoreIoSnafu {
                path: path.to_string(),
            })
    }

    async fn timed<T>(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunState, StepName};
    use chrono::{TimeZone, Utc};
    use sleet_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store(temp_dir: &TempDir) -> RunStore {
        RunStore::new(Arc::new(
            StorageProvider::for_url(temp_dir.path().to_str().unwrap())
                .await
                .unwrap(),
        ))
    }

    fn run_at(day: u32) -> Run {
        Run::new("logistics", Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_missing_run_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        assert!(
            store
                .load("logistics", "logistics__20240101T000000Z")
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.latest("logistics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        let mut run = run_at(1);
        run.begin_step(StepName::Detect);
        store.save(&run).await.unwrap();

        let loaded = store.load("logistics", &run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.state, RunState::Detecting);
        assert!(
            temp_dir
                .path()
                .join("runs/logistics/logistics__20240101T000000Z.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_latest_picks_most_recent_logical_time() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        for day in [3, 1, 2] {
            store.save(&run_at(day)).await.unwrap();
        }

        let latest = store.latest("logistics").await.unwrap().unwrap();
        assert_eq!(latest.id, "logistics__20240103T000000Z");
    }

    #[tokio::test]
    async fn test_manifest_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        let run = run_at(1);

        assert!(
            store
                .load_manifest("logistics", &run.id)
                .await
                .unwrap()
                .is_none()
        );

        let outcome = LoadOutcome {
            rows_written: 3,
            partitions: vec!["date=2024-01-01".to_string()],
            query_id: "sleet_logistics__20240101T000000Z".to_string(),
            input_files: vec!["logistics_2024-01-01.csv".to_string()],
        };
        store
            .save_manifest("logistics", &run.id, &outcome)
            .await
            .unwrap();

        let loaded = store
            .load_manifest("logistics", &run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_as_transient() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir)
            .await
            .with_call_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let err = store
            .timed("get", std::future::pending::<Result<Bytes, StorageError>>())
            .await
            .unwrap_err();

        assert_eq!(started.elapsed().as_secs(), 5);
        assert!(matches!(err, StorageError::TimedOut { secs: 5, .. }));
        let err = RunStoreError::StoreIo {
            path: "runs/logistics/x.json".to_string(),
            source: err,
        };
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_decode_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        let dir = temp_dir.path().join("runs/logistics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.json"), b"{not json").unwrap();

        let err = store.load("logistics", "broken").await.unwrap_err();
        assert!(matches!(err, RunStoreError::Decode { .. }));
        assert!(!err.is_transient());
    }
}
