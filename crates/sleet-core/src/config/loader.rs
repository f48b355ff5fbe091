//! Multi-file configuration loading.

use std::path::Path;

use indexmap::IndexMap;

use crate::config::{ConfigPath, GlobalConfig, MetricsConfig, interpolate, is_yaml_file};
use crate::error::ConfigError;

/// Trait for configs that can be merged from multiple files.
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Fold `other` into `self`. Component keys must be unique across files.
    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(|key| key.to_string())
            .collect();

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        for (key, component) in other.components_mut().drain(..) {
            self.components_mut().insert(key, component);
        }

        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        Ok(())
    }
}

/// Load and merge every file and directory in order.
///
/// All failures are collected so one invocation reports every broken file.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for path in paths {
        let (display, loaded) = match path {
            ConfigPath::File(file_path) => (file_path.display(), load_file::<C>(file_path)),
            ConfigPath::Dir(dir_path) => (dir_path.display(), load_dir::<C>(dir_path)),
        };
        if let Err(e) = loaded.and_then(|partial| config.merge(partial)) {
            errors.push(format!("{display}: {e}"));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

/// Interpolate environment variables in `contents` and parse the result.
pub fn load_from_str<C: Mergeable>(contents: &str) -> Result<C, ConfigError> {
    let result = interpolate(contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }
    C::parse_yaml(&result.text)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let contents =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;

    load_from_str(&contents)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();

    files.sort();

    for path in files {
        if let Err(e) = load_file::<C>(&path).and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {}", path.display(), e));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        items: IndexMap<String, u32>,
        #[serde(default)]
        global: GlobalConfig,
        #[serde(default)]
        metrics: MetricsConfig,
    }

    impl Mergeable for TestConfig {
        type Key = String;
        type Component = u32;

        fn components(&self) -> &IndexMap<String, u32> {
            &self.items
        }
        fn components_mut(&mut self) -> &mut IndexMap<String, u32> {
            &mut self.items
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

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_merge_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.yaml", "items:\n  first: 1\n");
        let b = write_file(dir.path(), "b.yml", "items:\n  second: 2\nglobal:\n  poll_jitter_secs: 7\n");

        let config: TestConfig =
            load_from_paths(&[ConfigPath::file(a), ConfigPath::file(b)]).unwrap();
        let keys: Vec<_> = config.items.keys().cloned().collect();
        assert_eq!(keys, vec!["first", "second"]);
        assert_eq!(config.global.poll_jitter_secs, 7);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.yaml", "items:\n  same: 1\n");
        let b = write_file(dir.path(), "b.yaml", "items:\n  same: 2\n");

        let err = load_from_paths::<TestConfig>(&[ConfigPath::file(a), ConfigPath::file(b)])
            .unwrap_err();
        assert!(err.to_string().contains("same"));
    }

    #[test]
    fn test_directory_loading_skips_non_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "01.yaml", "items:\n  one: 1\n");
        write_file(dir.path(), "02.yaml", "items:\n  two: 2\n");
        write_file(dir.path(), "notes.txt", "not yaml at all: [");

        let config: TestConfig = load_from_paths(&[ConfigPath::dir(dir.path())]).unwrap();
        assert_eq!(config.items.len(), 2);
        assert_eq!(config.items["two"], 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "config.toml", "items = {}");
        let err = load_from_paths::<TestConfig>(&[ConfigPath::file(path)]).unwrap_err();
        assert!(err.to_string().contains("only .yaml/.yml supported"));
    }

    #[test]
    fn test_load_from_str_interpolates_defaults() {
        let config: TestConfig =
            load_from_str("items:\n  value: ${SLEET_LOADER_TEST_UNSET_VAR:-42}\n").unwrap();
        assert_eq!(config.items["value"], 42);
    }
}
