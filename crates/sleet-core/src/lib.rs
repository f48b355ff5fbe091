//! Shared infrastructure for the sleet pipeline coordinator.
//!
//! - Multi-cloud storage (`StorageProvider`) with connection pooling
//! - YAML configuration loading, merging and validation helpers
//! - Error types, metrics, tracing and signal handling
//! - Retry/backoff, bounded polling and the multi-pipeline runner

pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod resource;
pub mod retry;
pub mod signal;
pub mod storage;
pub mod topology;
pub mod tracing;

pub use error::{ConfigError, MetricsError, PipelineSetupError, StorageError};
pub use metrics::init as init_metrics;
pub use polling::{PollOutcome, PollSchedule, poll_until};
pub use resource::{StoragePool, StoragePoolRef};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use signal::shutdown_signal;
pub use storage::{BackendConfig, StorageProvider, StorageProviderRef, get_or_create_storage};
pub use topology::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
pub use self::tracing::init_tracing;
