//! Sleet: file-arrival-triggered partition loader.
//!
//! Each scheduled run of a pipeline:
//! - Waits for source objects to arrive under a raw prefix
//! - Converges the database, staging table and partitioned table schemas
//! - Loads the staged rows into date partitions
//! - Moves the loaded source objects to an archive location
//!
//! Every step transition is persisted, so an interrupted run resumes from the
//! step that did not finish.

pub mod archive;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod engine;
pub mod error;
pub mod load;
pub mod metrics;
pub mod run;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use cli::{Cli, Command};
pub use config::{Config, PipelineConfig, PipelineKey};
pub use coordinator::{Components, Coordinator};
pub use error::PipelineError;
pub use run::{Run, RunOutcome, RunState, RunStore, StepName, StepStatus};
pub use scheduler::{Registration, ScheduledPipeline, Scheduler};

pub use sleet_core::{StorageProvider, StorageProviderRef, init_tracing, shutdown_signal};
