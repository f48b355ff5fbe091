//! Common error types shared across sleet crates.
//!
//! This module defines error types for storage, configuration and metrics
//! operations that every pipeline component relies on.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },

    /// A storage call did not complete within its time budget.
    #[snafu(display("Storage operation '{operation}' timed out after {secs}s"))]
    TimedOut { operation: String, secs: u64 },

    /// A copied object did not match its source.
    #[snafu(display(
        "Copy verification failed for {path}: expected {expected} bytes, found {actual}"
    ))]
    CopyMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }

    /// Check if a conditional create lost against an existing object.
    pub fn is_already_exists(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(
                    source,
                    object_store::Error::AlreadyExists { .. }
                        | object_store::Error::Precondition { .. }
                )
            }
            _ => false,
        }
    }

    /// Check if retrying the operation could succeed.
    ///
    /// Connectivity failures and timeouts are transient. Missing objects,
    /// conflicts, bad configuration and unsupported operations are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::TimedOut { .. } | StorageError::Io { .. } => true,
            StorageError::ObjectStore { source } => matches!(
                source,
                object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
            ),
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required field of a pipeline is empty.
    #[snafu(display("Pipeline '{pipeline}' has empty {field}"))]
    EmptyField { pipeline: String, field: String },

    /// A table definition is malformed.
    #[snafu(display("Pipeline '{pipeline}' has invalid {table} definition: {message}"))]
    InvalidTable {
        pipeline: String,
        table: String,
        message: String,
    },

    /// A schedule or detection setting is out of range.
    #[snafu(display("Pipeline '{pipeline}' has invalid {field}: {message}"))]
    InvalidSetting {
        pipeline: String,
        field: String,
        message: String,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Resource conflict detected (e.g., two pipelines watching the same prefix).
    #[snafu(display("Resource conflict: {message}"))]
    ResourceConflict { message: String },

    /// Duplicate component keys found across config files.
    #[snafu(display("Duplicate component keys: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },

    /// A pipeline referenced on the command line is not configured.
    #[snafu(display("Unknown pipeline '{pipeline}'"))]
    UnknownPipeline { pipeline: String },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,
}

// ============ Pipeline Setup Errors ============

/// Errors that can occur during pipeline setup (before running).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineSetupError {
    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Failed to initialize metrics.
    #[snafu(display("Failed to initialize metrics: {source}"))]
    Metrics { source: MetricsError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = StorageError::ObjectStore {
            source: object_store::Error::NotFound {
                path: "a/b".to_string(),
                source: "missing".into(),
            },
        };
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_already_exists_classification() {
        let err = StorageError::ObjectStore {
            source: object_store::Error::AlreadyExists {
                path: "a/b".to_string(),
                source: "exists".into(),
            },
        };
        assert!(err.is_already_exists());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let timeout = StorageError::TimedOut {
            operation: "list".to_string(),
            secs: 30,
        };
        assert!(timeout.is_transient());

        let generic = StorageError::ObjectStore {
            source: object_store::Error::Generic {
                store: "S3",
                source: "connection reset".into(),
            },
        };
        assert!(generic.is_transient());

        let invalid = StorageError::InvalidUrl {
            url: "nope://".to_string(),
        };
        assert!(!invalid.is_transient());
    }
}
