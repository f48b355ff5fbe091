//! Error types for the sleet coordinator.
//!
//! Component errors (detector, schema manager, loader, archiver) are wrapped
//! into a [`StepError`] carrying the step name, and a [`StepError`] into a
//! [`RunError`] carrying the run id. Whether an error is worth retrying is
//! decided by the `is_transient` helpers, never by the caller.

use snafu::prelude::*;

pub use sleet_core::error::{ConfigError, PipelineSetupError, StorageError};

use crate::run::StepName;

// ============ Query Engine Errors ============

/// Errors returned by a [`QueryEngine`](crate::engine::QueryEngine).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// Connectivity problem or timeout; the statement may be re-issued.
    #[snafu(display("Transient engine failure: {message}"))]
    Transient { message: String },

    /// The engine understood the statement and refused it.
    #[snafu(display("Statement rejected: {message}"))]
    Semantic { message: String },

    /// A create statement found an existing object with the same name.
    #[snafu(display("Object '{name}' already exists"))]
    AlreadyExists { name: String },

    /// A statement referenced an object that does not exist.
    #[snafu(display("Object '{name}' does not exist"))]
    NotFound { name: String },

    /// Reading or writing table data failed.
    #[snafu(display("Engine storage failure: {source}"))]
    Storage { source: StorageError },

    /// A catalog document could not be encoded or decoded.
    #[snafu(display("Corrupt catalog entry '{name}': {source}"))]
    Catalog {
        name: String,
        source: serde_json::Error,
    },

    /// Staging data could not be parsed as delimited text.
    #[snafu(display("Failed to read delimited data from {path}: {source}"))]
    Delimited { path: String, source: csv::Error },
}

impl EngineError {
    /// Whether re-issuing the same statement could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Transient { .. } => true,
            EngineError::Storage { source } => source.is_transient(),
            _ => false,
        }
    }
}

// ============ Schema Errors ============

/// Errors from converging databases and tables to their definitions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// An object of a different kind holds the name, or a concurrent create won.
    #[snafu(display("Schema conflict on '{name}': {message}"))]
    Conflict { name: String, message: String },

    /// The existing table differs from the desired definition.
    #[snafu(display("Schema drift on '{name}': {}", differences.join("; ")))]
    Drift {
        name: String,
        differences: Vec<String>,
    },

    /// The definition is malformed and was never sent to the engine.
    #[snafu(display("Invalid definition for '{name}': {message}"))]
    InvalidDefinition { name: String, message: String },

    /// The engine call failed after retries, or was rejected.
    #[snafu(display("Engine call for '{name}' failed: {source}"))]
    Engine { name: String, source: EngineError },
}

impl SchemaError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SchemaError::Engine { source, .. } if source.is_transient())
    }
}

// ============ Detection Errors ============

/// Errors from waiting for new source objects.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DetectError {
    /// Nothing arrived under the prefix before the detection timeout.
    #[snafu(display(
        "No objects arrived under {namespace}/{prefix} after {polls} polls ({waited_secs}s)"
    ))]
    NoArrivalTimeout {
        namespace: String,
        prefix: String,
        polls: u32,
        waited_secs: u64,
    },

    /// The wait was cancelled.
    #[snafu(display("Detection cancelled after {polls} polls"))]
    DetectCancelled { polls: u32 },

    /// Listing failed with a non-transient error.
    #[snafu(display("Failed to list {namespace}/{prefix}: {source}"))]
    List {
        namespace: String,
        prefix: String,
        source: StorageError,
    },
}

// ============ Load Errors ============

/// Errors from loading staging rows into the partitioned table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// The insert reported rows it could not write.
    #[snafu(display("Insert into {table} rejected {failed_rows} row(s)"))]
    RowsRejected { table: String, failed_rows: u64 },

    /// The insert statement failed.
    #[snafu(display("Insert into {table} failed: {source}"))]
    Insert { table: String, source: EngineError },

    /// The load manifest could not be read or written.
    #[snafu(display("Load manifest error: {source}"))]
    Manifest { source: RunStoreError },
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        match self {
            LoadError::Insert { source, .. } => source.is_transient(),
            LoadError::Manifest { source } => source.is_transient(),
            LoadError::RowsRejected { .. } => false,
        }
    }
}

// ============ Archive Errors ============

/// Errors from moving processed objects to the archive.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ArchiveError {
    /// Some objects were moved before one failed.
    #[snafu(display(
        "Archive interrupted after moving {} object(s); '{failed_key}' failed: {source}",
        moved.len()
    ))]
    ArchivePartial {
        moved: Vec<String>,
        failed_key: String,
        source: StorageError,
    },

    /// The first move failed, nothing was archived.
    #[snafu(display("Failed to archive '{key}': {source}"))]
    Move { key: String, source: StorageError },

    /// Listing the objects to archive failed.
    #[snafu(display("Failed to list objects to archive under {namespace}/{prefix}: {source}"))]
    ArchiveList {
        namespace: String,
        prefix: String,
        source: StorageError,
    },
}

// ============ Step / Run Errors ============

/// A component error tagged with the step that produced it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StepError {
    #[snafu(display("Step {step} failed: {source}"))]
    Detect { step: StepName, source: DetectError },

    #[snafu(display("Step {step} failed: {source}"))]
    Schema { step: StepName, source: SchemaError },

    #[snafu(display("Step {step} failed: {source}"))]
    Load { step: StepName, source: LoadError },

    #[snafu(display("Step {step} failed: {source}"))]
    Archive { step: StepName, source: ArchiveError },

    /// Shutdown was requested while the step was running.
    #[snafu(display("Step {step} cancelled"))]
    StepCancelled { step: StepName },
}

impl StepError {
    /// The step that failed.
    pub fn step(&self) -> StepName {
        match self {
            StepError::Detect { step, .. }
            | StepError::Schema { step, .. }
            | StepError::Load { step, .. }
            | StepError::Archive { step, .. }
            | StepError::StepCancelled { step } => *step,
        }
    }
}

/// Errors from executing a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// A step failed; the run is recorded as failed.
    #[snafu(display("Run {run_id} failed: {source}"))]
    Step { run_id: String, source: StepError },

    /// Shutdown was requested between steps.
    #[snafu(display("Run {run_id} cancelled before step {step}"))]
    Cancelled { run_id: String, step: StepName },

    /// The run record could not be read or written.
    #[snafu(display("Run {run_id} could not be persisted: {source}"))]
    Persist {
        run_id: String,
        source: RunStoreError,
    },
}

impl RunError {
    /// The failing step, if the run got as far as one.
    pub fn failed_step(&self) -> Option<StepName> {
        match self {
            RunError::Step { source, .. } => Some(source.step()),
            RunError::Cancelled { step, .. } => Some(*step),
            RunError::Persist { .. } => None,
        }
    }
}

// ============ Run Store Errors ============

/// Errors from persisting run records and load manifests.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunStoreError {
    #[snafu(display("Run store I/O failed for {path}: {source}"))]
    StoreIo { path: String, source: StorageError },

    #[snafu(display("Failed to encode {path}: {source}"))]
    Encode {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode {path}: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },
}

impl RunStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RunStoreError::StoreIo { source, .. } if source.is_transient())
    }
}

// ============ Pipeline Errors ============

/// Top-level errors surfaced by the binary and the scheduler loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Opening a storage location failed while wiring a pipeline.
    #[snafu(display("Failed to open storage: {source}"))]
    Connect { source: StorageError },

    /// A run failed.
    #[snafu(display("{source}"))]
    Run { source: RunError },

    /// Run store error outside of a run.
    #[snafu(display("Run store error: {source}"))]
    Store { source: RunStoreError },

    /// Opening the query engine failed while wiring a pipeline.
    #[snafu(display("Failed to open query engine: {source}"))]
    OpenEngine { source: EngineError },

    /// A logical time argument could not be parsed.
    #[snafu(display("Invalid logical time '{value}': expected RFC 3339 or YYYY-MM-DD"))]
    LogicalTime { value: String },

    /// Metrics or runner setup failed.
    #[snafu(display("Setup error: {source}"))]
    Setup { source: PipelineSetupError },
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Connect { source }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<RunError> for PipelineError {
    fn from(source: RunError) -> Self {
        PipelineError::Run { source }
    }
}

impl From<RunStoreError> for PipelineError {
    fn from(source: RunStoreError) -> Self {
        PipelineError::Store { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed_out() -> StorageError {
        StorageError::TimedOut {
            operation: "list".to_string(),
            secs: 60,
        }
    }

    #[test]
    fn test_engine_transient_classification() {
        assert!(
            EngineError::Transient {
                message: "connection reset".to_string()
            }
            .is_transient()
        );
        assert!(EngineError::Storage { source: timed_out() }.is_transient());
        assert!(
            !EngineError::Semantic {
                message: "bad".to_string()
            }
            .is_transient()
        );
        assert!(
            !EngineError::AlreadyExists {
                name: "db".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_schema_drift_lists_differences() {
        let err = SchemaError::Drift {
            name: "logistics.staging".to_string(),
            differences: vec!["column a added".to_string(), "delimiter ',' -> '|'".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("column a added"));
        assert!(msg.contains("delimiter"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_archive_partial_display() {
        let err = ArchiveError::ArchivePartial {
            moved: vec!["a.csv".to_string(), "b.csv".to_string()],
            failed_key: "c.csv".to_string(),
            source: timed_out(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 object(s)"));
        assert!(msg.contains("c.csv"));
    }

    #[test]
    fn test_run_error_reports_step() {
        let err = RunError::Step {
            run_id: "logistics__20240101T000000Z".to_string(),
            source: StepError::Load {
                step: StepName::Load,
                source: LoadError::RowsRejected {
                    table: "logistics.by_date".to_string(),
                    failed_rows: 3,
                },
            },
        };
        assert_eq!(err.failed_step(), Some(StepName::Load));
        assert!(err.to_string().contains("Step load failed"));
        assert!(err.to_string().contains("3 row(s)"));
    }
}
