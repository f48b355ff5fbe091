//! Configuration for the sleet coordinator.

mod pipeline_key;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use sleet_core::config::{
    ConfigArgs, ConfigPath, GlobalConfig, Mergeable, MetricsConfig, Resource, load_from_paths,
    load_from_str,
};
pub use sleet_core::{BackendConfig, PollSchedule, RetryPolicy};
pub use pipeline_key::PipelineKey;

use crate::error::ConfigError;
use crate::schema::{ColumnDef, PartitionedTableDef, StagingTableDef};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_POLLS: u64 = 10;

fn default_delimiter() -> char {
    ','
}

fn default_skip_header_lines() -> u32 {
    1
}

fn default_remote_call_timeout_secs() -> u64 {
    60
}

/// How long to wait for files, and how often to look.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Seconds between polls (default 30, or derived from the timeout).
    pub poll_interval_secs: Option<u64>,
    /// Seconds before giving up (default 10 polls worth of interval).
    pub timeout_secs: Option<u64>,
    /// Fail the run instead of skipping it when nothing arrives.
    #[serde(default)]
    pub fail_on_timeout: bool,
}

impl DetectionConfig {
    /// Resolve the configured values into a poll schedule.
    ///
    /// With nothing configured this polls every 30s, 10 times. An interval on
    /// its own keeps the 10-poll budget; a timeout on its own polls every 30s.
    pub fn poll_schedule(&self) -> PollSchedule {
        let (interval, timeout) = match (self.poll_interval_secs, self.timeout_secs) {
            (Some(interval), Some(timeout)) => (interval, timeout),
            (Some(interval), None) => (interval, interval.saturating_mul(DEFAULT_MAX_POLLS)),
            (None, Some(timeout)) => (DEFAULT_POLL_INTERVAL_SECS, timeout),
            (None, None) => (
                DEFAULT_POLL_INTERVAL_SECS,
                DEFAULT_POLL_INTERVAL_SECS * DEFAULT_MAX_POLLS,
            ),
        };
        PollSchedule::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }
}

/// External table over the raw files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingTableConfig {
    pub name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_skip_header_lines")]
    pub skip_header_lines: u32,
    pub columns: Vec<ColumnDef>,
}

/// Partitioned table the rows end up in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetTableConfig {
    pub name: String,
    /// Table root. Defaults to `{warehouse_uri}/{database}.db/{name}`.
    pub location: Option<String>,
    /// Data columns, without the partition column.
    pub columns: Vec<ColumnDef>,
}

/// Named schedule intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInterval {
    Hourly,
    Daily,
    Weekly,
}

/// When runs are due.
///
/// Either a named `interval` (daily when nothing is set) or `every_secs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub interval: Option<ScheduleInterval>,
    pub every_secs: Option<u64>,
    /// First slot to consider, RFC 3339.
    pub start_date: Option<DateTime<Utc>>,
    /// Run every missed slot since `start_date` instead of only the latest.
    #[serde(default)]
    pub catchup: bool,
}

/// Configuration for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Bucket (or directory) files land in, e.g. `s3://raw-bucket`.
    pub raw_namespace: String,
    /// Directory under the raw namespace to watch, e.g. `input_data/`.
    pub raw_prefix: String,
    /// Bucket processed files are moved to, keeping their keys.
    pub archive_namespace: String,
    /// Root of the table catalog and default table locations.
    pub warehouse_uri: String,
    /// Where run records and load manifests are kept.
    pub state_uri: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    pub database: String,
    pub partition_column: String,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub staging_table: StagingTableConfig,
    pub target_table: TargetTableConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_remote_call_timeout_secs")]
    pub remote_call_timeout_secs: u64,
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

impl PipelineConfig {
    /// Raw prefix as a relative directory: no leading slash, one trailing slash.
    pub fn raw_prefix_dir(&self) -> String {
        let trimmed = self.raw_prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    /// URL of the directory the staging table reads.
    pub fn staging_location(&self) -> String {
        join_url(&self.raw_namespace, &self.raw_prefix)
    }

    /// URL of the directory processed files end up in.
    pub fn archive_destination(&self) -> String {
        join_url(&self.archive_namespace, &self.raw_prefix)
    }

    pub fn target_location(&self) -> String {
        match &self.target_table.location {
            Some(location) => location.trim_end_matches('/').to_string(),
            None => join_url(
                &self.warehouse_uri,
                &format!("{}.db/{}", self.database, self.target_table.name),
            ),
        }
    }

    pub fn staging_def(&self) -> StagingTableDef {
        StagingTableDef {
            database: self.database.clone(),
            name: self.staging_table.name.clone(),
            columns: self.staging_table.columns.clone(),
            delimiter: self.staging_table.delimiter,
            skip_header_lines: self.staging_table.skip_header_lines,
            location: self.staging_location(),
        }
    }

    /// The partition column takes its type from the staging table.
    pub fn target_def(&self) -> PartitionedTableDef {
        let partition_column = self
            .staging_table
            .columns
            .iter()
            .find(|c| c.name == self.partition_column)
            .cloned()
            .unwrap_or_else(|| ColumnDef::string(&self.partition_column));

        PartitionedTableDef {
            database: self.database.clone(),
            name: self.target_table.name.clone(),
            columns: self.target_table.columns.clone(),
            partition_column,
            location: self.target_location(),
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        self.detection.poll_schedule()
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }

    /// Locations this pipeline must own exclusively.
    ///
    /// Two pipelines draining one prefix would archive each other's files,
    /// and two pipelines writing one table location would interleave
    /// partitions.
    pub fn resources(&self) -> Vec<Resource> {
        vec![
            Resource::prefix(&self.staging_location()),
            Resource::prefix(&self.archive_destination()),
            Resource::location(&self.target_location()),
        ]
    }

    /// Check one pipeline in isolation.
    pub fn validate(&self, key: &PipelineKey) -> Result<(), ConfigError> {
        let pipeline = key.id().to_string();
        let setting = |field: &str, message: String| ConfigError::InvalidSetting {
            pipeline: pipeline.clone(),
            field: field.to_string(),
            message,
        };

        if !key.is_path_safe() {
            return Err(setting(
                "name",
                "only ASCII letters, digits, '-' and '_' are allowed".to_string(),
            ));
        }

        for (field, value) in [
            ("raw_namespace", &self.raw_namespace),
            ("raw_prefix", &self.raw_prefix),
            ("archive_namespace", &self.archive_namespace),
            ("warehouse_uri", &self.warehouse_uri),
            ("state_uri", &self.state_uri),
            ("database", &self.database),
            ("partition_column", &self.partition_column),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    pipeline: pipeline.clone(),
                    field: field.to_string(),
                });
            }
        }

        for (field, url) in [
            ("raw_namespace", self.raw_namespace.as_str()),
            ("archive_namespace", self.archive_namespace.as_str()),
            ("warehouse_uri", self.warehouse_uri.as_str()),
            ("state_uri", self.state_uri.as_str()),
        ] {
            if let Err(e) = BackendConfig::parse_url(url) {
                return Err(setting(field, e.to_string()));
            }
        }

        if self.raw_namespace.trim_end_matches('/') == self.archive_namespace.trim_end_matches('/')
        {
            return Err(setting(
                "archive_namespace",
                "must differ from raw_namespace".to_string(),
            ));
        }

        let table = |table: &str, message: String| ConfigError::InvalidTable {
            pipeline: pipeline.clone(),
            table: table.to_string(),
            message,
        };

        self.staging_def()
            .validate()
            .map_err(|e| table("staging_table", e.to_string()))?;
        self.target_def()
            .validate()
            .map_err(|e| table("target_table", e.to_string()))?;

        let staging_has = |name: &str| self.staging_table.columns.iter().any(|c| c.name == name);
        if !staging_has(&self.partition_column) {
            return Err(table(
                "staging_table",
                format!(
                    "partition column '{}' is not a staging column",
                    self.partition_column
                ),
            ));
        }
        if let Some(missing) = self
            .target_table
            .columns
            .iter()
            .find(|c| !staging_has(&c.name))
        {
            return Err(table(
                "target_table",
                format!("column '{}' is not a staging column", missing.name),
            ));
        }

        if self.detection.poll_interval_secs == Some(0) {
            return Err(setting(
                "detection.poll_interval_secs",
                "must be positive".to_string(),
            ));
        }
        if self.detection.timeout_secs == Some(0) {
            return Err(setting("detection.timeout_secs", "must be positive".to_string()));
        }

        if self.schedule.interval.is_some() && self.schedule.every_secs.is_some() {
            return Err(setting(
                "schedule",
                "set either interval or every_secs, not both".to_string(),
            ));
        }
        if self.schedule.every_secs == Some(0) {
            return Err(setting("schedule.every_secs", "must be positive".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(setting("retry.max_attempts", "must be at least 1".to_string()));
        }
        if self.remote_call_timeout_secs == 0 {
            return Err(setting(
                "remote_call_timeout_secs",
                "must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Main configuration for sleet.
///
/// # Example
///
/// ```yaml
/// pipelines:
///   logistics:
///     raw_namespace: s3://raw-bucket
///     raw_prefix: input_data/
///     archive_namespace: s3://archive-bucket
///     warehouse_uri: s3://warehouse
///     state_uri: s3://sleet-state
///     database: logistics
///     partition_column: date
///     staging_table:
///       name: logistics_staging
///       columns: [{ name: delivery_id }, { name: date }]
///     target_table:
///       name: logistics_by_date
///       columns: [{ name: delivery_id }]
///
/// global:
///   total_concurrency: 4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipelines: IndexMap<PipelineKey, PipelineConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Mergeable for Config {
    type Key = PipelineKey;
    type Component = PipelineConfig;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component> {
        &self.pipelines
    }

    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component> {
        &mut self.pipelines
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }
}

impl Config {
    /// Load, merge and validate configuration from files and directories.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = load_from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every pipeline, then check that no two pipelines claim the
    /// same prefix or table location.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, pipeline) in &self.pipelines {
            pipeline.validate(key)?;
        }

        let conflicts = Resource::conflicts(
            self.pipelines
                .iter()
                .map(|(key, config)| (key.id().to_string(), config.resources())),
        );

        if !conflicts.is_empty() {
            let mut lines: Vec<String> = conflicts
                .iter()
                .map(|(resource, keys)| {
                    let mut keys: Vec<_> = keys.iter().cloned().collect();
                    keys.sort();
                    format!("{resource} claimed by: {}", keys.join(", "))
                })
                .collect();
            lines.sort();
            return Err(ConfigError::ResourceConflict {
                message: lines.join("; "),
            });
        }

        Ok(())
    }

    /// Look up one pipeline by name.
    pub fn pipeline(&self, name: &str) -> Result<(&PipelineKey, &PipelineConfig), ConfigError> {
        self.pipelines
            .get_key_value(&PipelineKey::new(name))
            .ok_or_else(|| ConfigError::UnknownPipeline {
                pipeline: name.to_string(),
            })
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }
}
