//! Loading staging rows into the partitioned table.
//!
//! One set-based `INSERT ... SELECT` moves every row currently visible
//! through the staging table into the target, with the partition of each row
//! taken from the data. The session opts into dynamic partitioning and names
//! the query after the run, so the engine writes deterministic output files.
//! A manifest of the committed outcome is stored per run; loading a run that
//! already has one returns the recorded outcome without touching the engine.

use serde::{Deserialize, Serialize};
use sleet_core::RetryPolicy;
use snafu::prelude::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{
    DYNAMIC_PARTITION, DYNAMIC_PARTITION_MODE, InsertSelect, QUERY_ID, QueryEngineRef, Session,
    Statement, execute_with_retry, sql,
};
use crate::error::{InsertSnafu, LoadError, ManifestSnafu, RowsRejectedSnafu};
use crate::run::RunStore;
use crate::schema::{PartitionedTableDef, StagingTableDef};

/// What a load committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub rows_written: u64,
    /// Partitions written, as `col=value`.
    pub partitions: Vec<String>,
    /// Query id the output files are named after.
    pub query_id: String,
    /// Source objects that were read, relative to the staging location.
    pub input_files: Vec<String>,
}

/// Query id used for a run's insert.
pub fn query_id_for(run_id: &str) -> String {
    format!("sleet_{run_id}")
}

pub struct PartitionLoader {
    engine: QueryEngineRef,
    runs: RunStore,
    pipeline: String,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl PartitionLoader {
    pub fn new(
        engine: QueryEngineRef,
        runs: RunStore,
        pipeline: impl Into<String>,
        retry: RetryPolicy,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            runs,
            pipeline: pipeline.into(),
            retry,
            call_timeout,
            cancel,
        }
    }

    /// Insert every staging row into `target`, partitioned by `partition_column`.
    ///
    /// Succeeds only if the engine wrote every row.
    pub async fn load_partitions(
        &self,
        run_id: &str,
        staging: &StagingTableDef,
        target: &PartitionedTableDef,
        partition_column: &str,
    ) -> Result<LoadOutcome, LoadError> {
        if let Some(outcome) = self
            .runs
            .load_manifest(&self.pipeline, run_id)
            .await
            .context(ManifestSnafu)?
        {
            info!(
                target = %self.pipeline,
                run_id,
                rows = outcome.rows_written,
                "Load already committed for this run, reusing manifest"
            );
            return Ok(outcome);
        }

        let query_id = query_id_for(run_id);
        let session = Session::new()
            .with(DYNAMIC_PARTITION, "true")
            .with(DYNAMIC_PARTITION_MODE, "nonstrict")
            .with(QUERY_ID, query_id.as_str());
        let statement = Statement::InsertSelect(InsertSelect {
            target: target.object_name(),
            source: staging.object_name(),
            columns: target.columns.iter().map(|c| c.name.clone()).collect(),
            partition_column: partition_column.to_string(),
        });
        debug!(sql = %sql::render_script(&session, &statement), "Load statement");

        let table = target.qualified_name();
        let result = execute_with_retry(
            self.engine.as_ref(),
            &session,
            &statement,
            &self.retry,
            self.call_timeout,
            &self.cancel,
        )
        .await
        .context(InsertSnafu {
            table: table.clone(),
        })?;

        ensure!(
            result.failed_rows == 0,
            RowsRejectedSnafu {
                table,
                failed_rows: result.failed_rows,
            }
        );

        let outcome = LoadOutcome {
            rows_written: result.rows_affected,
            partitions: result.partitions,
            query_id,
            input_files: result.input_files,
        };
        self.runs
            .save_manifest(&self.pipeline, run_id, &outcome)
            .await
            .context(ManifestSnafu)?;

        info!(
            target = %self.pipeline,
            run_id,
            rows = outcome.rows_written,
            partitions = outcome.partitions.len(),
            "Loaded partitions"
        );
        Ok(outcome)
    }
}
