//! Identifier for a configured pipeline.

use serde::{Deserialize, Serialize};
use sleet_core::config::ComponentKey;
use std::fmt;

/// Identifier for a pipeline in sleet configuration.
///
/// The key names the pipeline in logs and metrics and is part of every run
/// id and run-store path, so it must be path-safe (see
/// [`ComponentKey::is_path_safe`]).
///
/// ```
/// use sleet::config::PipelineKey;
///
/// let key = PipelineKey::new("logistics");
/// assert_eq!(key.id(), "logistics");
/// ```
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineKey(ComponentKey);

impl PipelineKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn is_path_safe(&self) -> bool {
        self.0.is_path_safe()
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PipelineKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}
