//! Resource conflict detection.
//!
//! Some storage locations must be owned by exactly one pipeline: two
//! pipelines draining the same raw prefix would archive each other's files.
//! Pipelines declare what they own and conflicts are reported at config
//! validation time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A location that cannot be shared between pipelines.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Resource {
    /// A prefix that a pipeline consumes and empties.
    Prefix(String),
    /// A table location that a pipeline writes.
    Location(String),
}

impl Resource {
    /// Create a prefix resource. Trailing slashes are ignored.
    ///
    /// ```
    /// use sleet_core::config::Resource;
    ///
    /// assert_eq!(
    ///     Resource::prefix("s3://raw/input_data/"),
    ///     Resource::prefix("s3://raw/input_data"),
    /// );
    /// ```
    pub fn prefix(path: &str) -> Self {
        Self::Prefix(path.trim_end_matches('/').to_string())
    }

    /// Create a table location resource. Trailing slashes are ignored.
    pub fn location(path: &str) -> Self {
        Self::Location(path.trim_end_matches('/').to_string())
    }

    /// Map every resource claimed by more than one component to its claimants.
    pub fn conflicts<K>(
        components: impl IntoIterator<Item = (K, Vec<Resource>)>,
    ) -> HashMap<Resource, HashSet<K>>
    where
        K: Eq + Hash + Clone,
    {
        let mut resource_to_keys: HashMap<Resource, HashSet<K>> = HashMap::new();

        for (key, resources) in components {
            for resource in resources {
                resource_to_keys
                    .entry(resource)
                    .or_default()
                    .insert(key.clone());
            }
        }

        resource_to_keys
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .collect()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(path) => write!(f, "prefix:{path}"),
            Self::Location(path) => write!(f, "location:{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_conflicts() {
        let components = vec![
            ("a", vec![Resource::prefix("s3://raw/a")]),
            ("b", vec![Resource::prefix("s3://raw/b")]),
        ];
        assert!(Resource::conflicts(components).is_empty());
    }

    #[test]
    fn test_prefix_conflict() {
        let components = vec![
            ("orders", vec![Resource::prefix("s3://raw/input_data/")]),
            ("returns", vec![Resource::prefix("s3://raw/returns")]),
            ("logistics", vec![Resource::prefix("s3://raw/input_data")]),
        ];

        let conflicts = Resource::conflicts(components);
        assert_eq!(conflicts.len(), 1);
        let keys = &conflicts[&Resource::prefix("s3://raw/input_data")];
        assert!(keys.contains(&"orders"));
        assert!(keys.contains(&"logistics"));
        assert!(!keys.contains(&"returns"));
    }

    #[test]
    fn test_prefix_and_location_are_distinct() {
        let components = vec![
            ("a", vec![Resource::prefix("s3://bucket/x")]),
            ("b", vec![Resource::location("s3://bucket/x")]),
        ];
        assert!(Resource::conflicts(components).is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(Resource::prefix("s3://raw/in/").to_string(), "prefix:s3://raw/in");
        assert_eq!(
            Resource::location("s3://wh/db/t").to_string(),
            "location:s3://wh/db/t"
        );
    }
}
