//! The run and step model.
//!
//! A [`Run`] is one execution of a pipeline for one logical schedule slot.
//! It holds a fixed, ordered list of [`StepRecord`]s; a step depends on the
//! step before it. Only the coordinator mutates a run, and it persists every
//! transition through the [`RunStore`] so a restarted process resumes from
//! the first step that has not succeeded.

mod store;

pub use store::RunStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::load::LoadOutcome;

/// The steps of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Detect,
    CreateDatabase,
    CreateStagingTable,
    CreatePartitionedTable,
    Load,
    Archive,
}

impl StepName {
    pub const ALL: [StepName; 6] = [
        StepName::Detect,
        StepName::CreateDatabase,
        StepName::CreateStagingTable,
        StepName::CreatePartitionedTable,
        StepName::Load,
        StepName::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Detect => "detect",
            StepName::CreateDatabase => "create_database",
            StepName::CreateStagingTable => "create_staging_table",
            StepName::CreatePartitionedTable => "create_partitioned_table",
            StepName::Load => "load",
            StepName::Archive => "archive",
        }
    }

    /// The run state while this step executes.
    pub fn state(&self) -> RunState {
        match self {
            StepName::Detect => RunState::Detecting,
            StepName::CreateDatabase
            | StepName::CreateStagingTable
            | StepName::CreatePartitionedTable => RunState::SchemaConverging,
            StepName::Load => RunState::Loading,
            StepName::Archive => RunState::Archiving,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Succeeded and skipped steps are never executed again.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: StepName,
    pub status: StepStatus,
    /// Times the step was started, across restarts.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Coordinator state machine.
///
/// `Pending -> Detecting -> SchemaConverging -> Loading -> Archiving ->
/// Succeeded`, with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Detecting,
    SchemaConverging,
    Loading,
    Archiving,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Detecting => "detecting",
            RunState::SchemaConverging => "schema_converging",
            RunState::Loading => "loading",
            RunState::Archiving => "archiving",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Data was loaded and its source objects archived.
    Loaded {
        rows: u64,
        partitions: Vec<String>,
        archived: usize,
    },
    /// Nothing arrived before the detection timeout.
    NoArrival,
}

/// Deterministic run id for a pipeline and logical time.
pub fn run_id(pipeline: &str, logical_time: DateTime<Utc>) -> String {
    format!("{pipeline}__{}", logical_time.format("%Y%m%dT%H%M%SZ"))
}

/// One execution of a pipeline for one schedule slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pipeline: String,
    pub logical_time: DateTime<Utc>,
    pub state: RunState,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// Display string of the error that failed the run.
    pub error: Option<String>,
    /// Keys seen by the detector, relative to the raw namespace.
    #[serde(default)]
    pub detected: Vec<String>,
    /// What the load step committed.
    #[serde(default)]
    pub load: Option<LoadOutcome>,
    /// Keys moved to the archive so far.
    #[serde(default)]
    pub archived: Vec<String>,
}

impl Run {
    pub fn new(pipeline: &str, logical_time: DateTime<Utc>) -> Self {
        Self {
            id: run_id(pipeline, logical_time),
            pipeline: pipeline.to_string(),
            logical_time,
            state: RunState::Pending,
            steps: StepName::ALL.iter().copied().map(StepRecord::pending).collect(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
            detected: Vec::new(),
            load: None,
            archived: Vec::new(),
        }
    }

    pub fn step(&self, name: StepName) -> &StepRecord {
        &self.steps[name.index()]
    }

    fn step_mut(&mut self, name: StepName) -> &mut StepRecord {
        &mut self.steps[name.index()]
    }

    /// The first step that has neither succeeded nor been skipped.
    pub fn next_step(&self) -> Option<StepName> {
        self.steps
            .iter()
            .find(|step| !step.status.is_done())
            .map(|step| step.name)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn begin_step(&mut self, name: StepName) {
        self.state = name.state();
        let step = self.step_mut(name);
        step.status = StepStatus::Running;
        step.attempts += 1;
        step.last_error = None;
        step.started_at = Some(Utc::now());
        step.finished_at = None;
    }

    pub fn complete_step(&mut self, name: StepName) {
        let step = self.step_mut(name);
        step.status = StepStatus::Succeeded;
        step.finished_at = Some(Utc::now());
    }

    /// Record the step as failed and move the run to `Failed`.
    pub fn fail_step(&mut self, name: StepName, error: &str) {
        let now = Utc::now();
        let step = self.step_mut(name);
        step.status = StepStatus::Failed;
        step.last_error = Some(error.to_string());
        step.finished_at = Some(now);

        self.state = RunState::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(now);
    }

    /// Mark `from` and every later step as skipped.
    pub fn skip_remaining(&mut self, from: StepName) {
        let now = Utc::now();
        for step in &mut self.steps[from.index()..] {
            step.status = StepStatus::Skipped;
            step.finished_at = Some(now);
        }
    }

    pub fn succeed(&mut self, outcome: RunOutcome) {
        self.state = RunState::Succeeded;
        self.outcome = Some(outcome);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Stop the run before `next` started. The step stays `Pending`.
    pub fn cancel(&mut self, next: StepName) {
        self.state = RunState::Failed;
        self.error = Some(format!("cancelled before step {next}"));
        self.finished_at = Some(Utc::now());
    }

    /// Prepare an unfinished run for another attempt.
    ///
    /// Covers failed runs and runs whose process died mid-step. Failed and
    /// interrupted steps go back to `Pending`; succeeded steps keep their
    /// status so they are not executed again. Returns false for a succeeded
    /// run, which is left untouched.
    pub fn reset_for_restart(&mut self) -> bool {
        if self.state == RunState::Succeeded {
            return false;
        }
        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Failed | StepStatus::Running) {
                step.status = StepStatus::Pending;
            }
        }
        self.state = RunState::Pending;
        self.error = None;
        self.finished_at = None;
        true
    }

    /// Steps that were started at least once in this run's lifetime.
    pub fn attempted_steps(&self) -> Vec<StepName> {
        self.steps
            .iter()
            .filter(|step| step.attempts > 0)
            .map(|step| step.name)
            .collect()
    }
}
