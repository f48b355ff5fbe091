//! Process-wide settings that apply to every configured pipeline.

use serde::{Deserialize, Serialize};

/// Global configuration shared across all pipelines in one process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Maximum number of runs executing at the same time across pipelines.
    ///
    /// `None` means every pipeline runs independently.
    #[serde(default)]
    pub total_concurrency: Option<usize>,

    /// Share one object store client per bucket across pipelines.
    #[serde(default)]
    pub connection_pooling: bool,

    /// Upper bound of the random delay applied before each pipeline starts,
    /// so many pipelines do not hit storage at the same instant.
    #[serde(default)]
    pub poll_jitter_secs: u64,
}

impl GlobalConfig {
    /// Merge values from another GlobalConfig (last non-default wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.total_concurrency.is_some() {
            self.total_concurrency = other.total_concurrency;
        }
        if other.connection_pooling {
            self.connection_pooling = true;
        }
        if other.poll_jitter_secs != 0 {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
    }
}
