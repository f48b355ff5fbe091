//! Internal events for coordinator metrics.
//!
//! Each struct is one measurable occurrence and implements
//! [`InternalEvent`] from `sleet_core`, so it is emitted with
//! `sleet_core::emit!`. Every metric carries a `pipeline` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

pub use sleet_core::metrics::events::InternalEvent;

use crate::run::StepName;

// ============================================================================
// Run events
// ============================================================================

/// A run started or resumed.
pub struct RunStarted {
    pub pipeline: String,
    /// True when a failed run is being retried.
    pub resumed: bool,
}

impl InternalEvent for RunStarted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, resumed = self.resumed, "Run started");
        counter!(
            "sleet_runs_started_total",
            "pipeline" => self.pipeline.clone(),
            "resumed" => if self.resumed { "true" } else { "false" }
        )
        .increment(1);
        gauge!("sleet_runs_active", "pipeline" => self.pipeline).increment(1.0);
    }
}

/// A run reached a terminal state, or stopped on cancellation.
pub struct RunFinished {
    pub pipeline: String,
    /// `loaded`, `no_arrival`, `failed` or `cancelled`.
    pub outcome: &'static str,
    pub duration: Duration,
}

impl InternalEvent for RunFinished {
    fn emit(self) {
        trace!(
            pipeline = %self.pipeline,
            outcome = self.outcome,
            duration_ms = self.duration.as_millis(),
            "Run finished"
        );
        counter!(
            "sleet_runs_finished_total",
            "pipeline" => self.pipeline.clone(),
            "outcome" => self.outcome
        )
        .increment(1);
        histogram!("sleet_run_duration_seconds", "pipeline" => self.pipeline.clone())
            .record(self.duration.as_secs_f64());
        gauge!("sleet_runs_active", "pipeline" => self.pipeline).decrement(1.0);
    }
}

// ============================================================================
// Step events
// ============================================================================

/// A step finished, successfully or not.
pub struct StepCompleted {
    pub pipeline: String,
    pub step: StepName,
    /// `succeeded`, `failed` or `skipped`.
    pub status: &'static str,
    pub duration: Duration,
}

impl InternalEvent for StepCompleted {
    fn emit(self) {
        trace!(
            pipeline = %self.pipeline,
            step = %self.step,
            status = self.status,
            duration_ms = self.duration.as_millis(),
            "Step completed"
        );
        counter!(
            "sleet_steps_total",
            "pipeline" => self.pipeline.clone(),
            "step" => self.step.as_str(),
            "status" => self.status
        )
        .increment(1);
        histogram!(
            "sleet_step_duration_seconds",
            "pipeline" => self.pipeline,
            "step" => self.step.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Component events
// ============================================================================

/// One listing of the raw prefix by the arrival detector.
pub struct DetectorPoll {
    pub pipeline: String,
    pub found: bool,
}

impl InternalEvent for DetectorPoll {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, found = self.found, "Detector poll");
        counter!(
            "sleet_detector_polls_total",
            "pipeline" => self.pipeline,
            "result" => if self.found { "found" } else { "empty" }
        )
        .increment(1);
    }
}

/// Rows committed by a load.
pub struct RowsLoaded {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for RowsLoaded {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Rows loaded");
        counter!("sleet_rows_loaded_total", "pipeline" => self.pipeline).increment(self.count);
    }
}

/// Partitions written by a load.
pub struct PartitionsWritten {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for PartitionsWritten {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Partitions written");
        counter!("sleet_partitions_written_total", "pipeline" => self.pipeline)
            .increment(self.count);
    }
}

/// Source objects moved to the archive.
pub struct ObjectsArchived {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for ObjectsArchived {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Objects archived");
        counter!("sleet_objects_archived_total", "pipeline" => self.pipeline)
            .increment(self.count);
    }
}
