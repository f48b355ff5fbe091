//! The pipeline coordinator.
//!
//! Drives one [`Run`] through its ordered steps:
//!
//! ```text
//! Detect -> CreateDatabase -> CreateStagingTable -> CreatePartitionedTable -> Load -> Archive
//! ```
//!
//! Each transition is persisted before the next step starts. A failing step
//! fails the run and nothing after it is attempted. Executing a run that
//! already exists resumes it from its first step that has not succeeded;
//! executing a succeeded run returns it unchanged.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use sleet_core::PipelineContext;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::Archiver;
use crate::config::{PipelineConfig, PipelineKey};
use crate::detect::ArrivalDetector;
use crate::engine::{QueryEngineRef, WarehouseEngine};
use crate::error::{
    ArchiveError, ArchiveSnafu, DetectError, DetectSnafu, LoadSnafu, OpenEngineSnafu,
    PersistSnafu, PipelineError, RunError, RunStoreError, SchemaSnafu, StepError,
};
use crate::load::PartitionLoader;
use crate::metrics::{PartitionsWritten, RowsLoaded, RunFinished, RunStarted, StepCompleted};
use crate::run::{Run, RunOutcome, RunState, RunStore, StepName, run_id};
use crate::schema::SchemaManager;
use crate::store::{ObjectStoreRef, PooledObjectStore};

/// The external collaborators of a coordinator.
#[derive(Clone)]
pub struct Components {
    pub store: ObjectStoreRef,
    pub engine: QueryEngineRef,
    pub runs: RunStore,
}

impl Components {
    /// Open the configured object store, warehouse engine and run store.
    pub async fn open(
        config: &PipelineConfig,
        context: &PipelineContext,
    ) -> Result<Self, PipelineError> {
        let pool = context.storage_pool.as_ref();
        let store = PooledObjectStore::new(
            context.storage_pool.clone(),
            config.storage_options.clone(),
            config.remote_call_timeout(),
        );
        let engine = WarehouseEngine::open(&config.warehouse_uri, pool, config.storage_options.clone())
            .await
            .context(OpenEngineSnafu)?;
        let runs = RunStore::open(&config.state_uri, pool, config.storage_options.clone())
            .await?
            .with_call_timeout(config.remote_call_timeout());

        Ok(Self {
            store: Arc::new(store),
            engine: Arc::new(engine),
            runs,
        })
    }
}

/// What a step asks the coordinator to do next.
enum StepFlow {
    Continue,
    /// Nothing arrived; the rest of the run is skipped.
    NoArrival,
}

pub struct Coordinator {
    key: PipelineKey,
    config: PipelineConfig,
    runs: RunStore,
    detector: ArrivalDetector,
    schema: SchemaManager,
    loader: PartitionLoader,
    archiver: Archiver,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Wire a coordinator from explicit components.
    pub fn new(
        key: PipelineKey,
        config: PipelineConfig,
        components: Components,
        cancel: CancellationToken,
    ) -> Self {
        let pipeline = key.id().to_string();
        let retry = config.retry.clone();
        let call_timeout = config.remote_call_timeout();

        let detector =
            ArrivalDetector::new(components.store.clone(), config.poll_schedule(), &pipeline);
        let schema = SchemaManager::new(
            components.engine.clone(),
            retry.clone(),
            call_timeout,
            cancel.clone(),
        );
        let loader = PartitionLoader::new(
            components.engine,
            components.runs.clone(),
            &pipeline,
            retry.clone(),
            call_timeout,
            cancel.clone(),
        );
        let archiver = Archiver::new(components.store, retry, cancel.clone(), &pipeline);

        Self {
            key,
            config,
            runs: components.runs,
            detector,
            schema,
            loader,
            archiver,
            cancel,
        }
    }

    /// Open the configured backends and wire a coordinator.
    pub async fn build(
        key: PipelineKey,
        config: PipelineConfig,
        context: &PipelineContext,
    ) -> Result<Self, PipelineError> {
        let components = Components::open(&config, context).await?;
        Ok(Self::new(key, config, components, context.shutdown.clone()))
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// The persisted run for a logical time, if any.
    pub async fn status(&self, logical_time: DateTime<Utc>) -> Result<Option<Run>, RunStoreError> {
        self.runs
            .load(self.key.id(), &run_id(self.key.id(), logical_time))
            .await
    }

    /// Execute, resume or return the run for `logical_time`.
    pub async fn execute(&self, logical_time: DateTime<Utc>) -> Result<Run, RunError> {
        let pipeline = self.key.id();
        let id = run_id(pipeline, logical_time);

        let existing = self
            .runs
            .load(pipeline, &id)
            .await
            .context(PersistSnafu { run_id: id.clone() })?;

        let (mut run, resumed) = match existing {
            Some(run) if run.state == RunState::Succeeded => {
                info!(target = %self.key, run_id = %id, "Run already succeeded");
                return Ok(run);
            }
            Some(mut run) => {
                run.reset_for_restart();
                info!(
                    target = %self.key,
                    run_id = %id,
                    next_step = ?run.next_step(),
                    "Resuming run"
                );
                (run, true)
            }
            None => (Run::new(pipeline, logical_time), false),
        };

        sleet_core::emit!(RunStarted {
            pipeline: pipeline.to_string(),
            resumed,
        });
        let started = Instant::now();
        self.persist(&run).await?;

        let result = self.drive(&mut run).await;
        let outcome = match (&result, &run.outcome) {
            (Ok(()), Some(RunOutcome::NoArrival)) => "no_arrival",
            (Ok(()), _) => "loaded",
            (Err(RunError::Cancelled { .. }), _) => "cancelled",
            (Err(_), _) => "failed",
        };
        sleet_core::emit!(RunFinished {
            pipeline: pipeline.to_string(),
            outcome,
            duration: started.elapsed(),
        });

        result.map(|()| run)
    }

    async fn drive(&self, run: &mut Run) -> Result<(), RunError> {
        while let Some(step) = run.next_step() {
            if self.cancel.is_cancelled() {
                run.cancel(step);
                self.persist(run).await?;
                warn!(target = %self.key, run_id = %run.id, step = %step, "Run cancelled");
                return Err(RunError::Cancelled {
                    run_id: run.id.clone(),
                    step,
                });
            }

            run.begin_step(step);
            self.persist(run).await?;
            info!(target = %self.key, run_id = %run.id, step = %step, "Step started");
            let started = Instant::now();

            let result = match self.cancel.run_until_cancelled(self.run_step(step, run)).await {
                Some(result) => result,
                None => Err(StepError::StepCancelled { step }),
            };

            match result {
                Ok(StepFlow::Continue) => {
                    run.complete_step(step);
                    self.persist(run).await?;
                    self.record_step(step, "succeeded", started);
                    info!(target = %self.key, run_id = %run.id, step = %step, "Step succeeded");
                }
                Ok(StepFlow::NoArrival) => {
                    run.skip_remaining(step);
                    run.succeed(RunOutcome::NoArrival);
                    self.persist(run).await?;
                    self.record_step(step, "skipped", started);
                    info!(
                        target = %self.key,
                        run_id = %run.id,
                        "Nothing arrived, remaining steps skipped"
                    );
                    return Ok(());
                }
                Err(e) => {
                    if let StepError::Archive {
                        source: ArchiveError::ArchivePartial { moved, .. },
                        ..
                    } = &e
                    {
                        run.archived = moved.clone();
                    }
                    let message = e.to_string();
                    run.fail_step(step, &message);
                    self.record_step(step, "failed", started);
                    error!(target = %self.key, run_id = %run.id, step = %step, error = %message, "Step failed");
                    self.persist(run).await?;
                    return Err(RunError::Step {
                        run_id: run.id.clone(),
                        source: e,
                    });
                }
            }
        }

        let (rows, partitions) = run
            .load
            .as_ref()
            .map(|load| (load.rows_written, load.partitions.clone()))
            .unwrap_or_default();
        run.succeed(RunOutcome::Loaded {
            rows,
            partitions,
            archived: run.archived.len(),
        });
        self.persist(run).await?;
        info!(target = %self.key, run_id = %run.id, rows, "Run succeeded");
        Ok(())
    }

    async fn run_step(&self, step: StepName, run: &mut Run) -> Result<StepFlow, StepError> {
        let config = &self.config;
        match step {
            StepName::Detect => {
                let prefix = config.raw_prefix_dir();
                match self
                    .detector
                    .wait_for_arrival(&config.raw_namespace, &prefix, &self.cancel)
                    .await
                {
                    Ok(objects) => {
                        run.detected = objects.into_iter().map(|o| o.key).collect();
                        Ok(StepFlow::Continue)
                    }
                    Err(DetectError::NoArrivalTimeout { polls, .. })
                        if !config.detection.fail_on_timeout =>
                    {
                        info!(target = %self.key, run_id = %run.id, polls, "No arrival before timeout");
                        Ok(StepFlow::NoArrival)
                    }
                    Err(DetectError::DetectCancelled { .. }) => {
                        Err(StepError::StepCancelled { step })
                    }
                    Err(e) => Err(e).context(DetectSnafu { step }),
                }
            }
            StepName::CreateDatabase => {
                self.schema
                    .ensure_database(&config.database)
                    .await
                    .context(SchemaSnafu { step })?;
                Ok(StepFlow::Continue)
            }
            StepName::CreateStagingTable => {
                self.schema
                    .ensure_staging_table(&config.staging_def())
                    .await
                    .context(SchemaSnafu { step })?;
                Ok(StepFlow::Continue)
            }
            StepName::CreatePartitionedTable => {
                self.schema
                    .ensure_partitioned_table(&config.target_def())
                    .await
                    .context(SchemaSnafu { step })?;
                Ok(StepFlow::Continue)
            }
            StepName::Load => {
                let outcome = self
                    .loader
                    .load_partitions(
                        &run.id,
                        &config.staging_def(),
                        &config.target_def(),
                        &config.partition_column,
                    )
                    .await
                    .context(LoadSnafu { step })?;

                sleet_core::emit!(RowsLoaded {
                    pipeline: self.key.id().to_string(),
                    count: outcome.rows_written,
                });
                sleet_core::emit!(PartitionsWritten {
                    pipeline: self.key.id().to_string(),
                    count: outcome.partitions.len() as u64,
                });
                run.load = Some(outcome);
                Ok(StepFlow::Continue)
            }
            StepName::Archive => {
                let moved = match &run.load {
                    // Archive exactly what the load read; later arrivals wait for the next run.
                    Some(load) => {
                        let prefix = config.raw_prefix_dir();
                        let keys: Vec<String> = load
                            .input_files
                            .iter()
                            .map(|file| format!("{prefix}{file}"))
                            .collect();
                        self.archiver
                            .archive_objects(&config.raw_namespace, &keys, &config.archive_namespace)
                            .await
                    }
                    None => {
                        self.archiver
                            .archive_processed(
                                &config.raw_namespace,
                                &config.raw_prefix_dir(),
                                &config.archive_namespace,
                            )
                            .await
                    }
                }
                .context(ArchiveSnafu { step })?;
                run.archived = moved;
                Ok(StepFlow::Continue)
            }
        }
    }

    async fn persist(&self, run: &Run) -> Result<(), RunError> {
        self.runs.save(run).await.context(PersistSnafu {
            run_id: run.id.clone(),
        })
    }

    fn record_step(&self, step: StepName, status: &'static str, started: Instant) {
        sleet_core::emit!(StepCompleted {
            pipeline: self.key.id().to_string(),
            step,
            status,
            duration: started.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::run::StepStatus;
    use bytes::Bytes;
    use chrono::TimeZone;
    use object_store::path::Path;
    use sleet_core::StorageProvider;
    use std::time::Duration;

    fn config(bucket: &str) -> (PipelineKey, PipelineConfig) {
        let yaml = format!(
            r#"
pipelines:
  logistics:
    raw_namespace: memory://{bucket}-raw
    raw_prefix: input_data/
    archive_namespace: memory://{bucket}-archive
    warehouse_uri: memory://{bucket}-warehouse
    state_uri: memory://{bucket}-state
    database: logistics
    partition_column: date
    detection: {{ poll_interval_secs: 30, timeout_secs: 60 }}
    staging_table:
      name: staging
      columns:
        - {{ name: delivery_id }}
        - {{ name: date }}
    target_table:
      name: by_date
      columns:
        - {{ name: delivery_id }}
"#
        );
        let config = Config::parse(&yaml).unwrap();
        let (key, pipeline) = config.pipeline("logistics").unwrap();
        (key.clone(), pipeline.clone())
    }

    async fn coordinator(bucket: &str, cancel: CancellationToken) -> Coordinator {
        let (key, config) = config(bucket);
        let context = PipelineContext::new(None, false, 0, cancel);
        Coordinator::build(key, config, &context).await.unwrap()
    }

    fn logical_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_full_run_succeeds() {
        let bucket = "coordinator-test-full";
        let raw = StorageProvider::for_url(&format!("memory://{bucket}-raw"))
            .await
            .unwrap();
        raw.put(
            &Path::from("input_data/logistics_2024-01-01.csv"),
            Bytes::from_static(b"delivery_id,date\nd1,2024-01-01\n"),
        )
        .await
        .unwrap();

        let coordinator = coordinator(bucket, CancellationToken::new()).await;
        let run = coordinator.execute(logical_time()).await.unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        assert_eq!(
            run.outcome,
            Some(RunOutcome::Loaded {
                rows: 1,
                partitions: vec!["date=2024-01-01".to_string()],
                archived: 1,
            })
        );
        assert_eq!(
            coordinator.status(logical_time()).await.unwrap(),
            Some(run)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_arrival_skips_remaining_steps() {
        let coordinator = coordinator("coordinator-test-empty", CancellationToken::new()).await;
        let run = coordinator.execute(logical_time()).await.unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.outcome, Some(RunOutcome::NoArrival));
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(run.attempted_steps(), vec![StepName::Detect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_on_timeout_fails_run() {
        let bucket = "coordinator-test-strict";
        let (key, mut config) = config(bucket);
        config.detection.fail_on_timeout = true;
        let context = PipelineContext::new(None, false, 0, CancellationToken::new());
        let coordinator = Coordinator::build(key, config, &context).await.unwrap();

        let err = coordinator.execute(logical_time()).await.unwrap_err();
        assert_eq!(err.failed_step(), Some(StepName::Detect));

        let run = coordinator.status(logical_time()).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.step(StepName::CreateDatabase).attempts, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_step_pending() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let coordinator = coordinator("coordinator-test-cancel", cancel).await;

        let err = coordinator.execute(logical_time()).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Cancelled {
                step: StepName::Detect,
                ..
            }
        ));

        let run = coordinator.status(logical_time()).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.step(StepName::Detect).status, StepStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_detect_fails_step() {
        let cancel = CancellationToken::new();
        let coordinator = coordinator("coordinator-test-mid-cancel", cancel.clone()).await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });

        let err = coordinator.execute(logical_time()).await.unwrap_err();
        let RunError::Step { source, .. } = err else {
            panic!("expected step error, got {err:?}");
        };
        assert!(matches!(source, StepError::StepCancelled { step: StepName::Detect }));

        let run = coordinator.status(logical_time()).await.unwrap().unwrap();
        assert_eq!(run.step(StepName::Detect).status, StepStatus::Failed);
        assert_eq!(run.state, RunState::Failed);
    }
}
