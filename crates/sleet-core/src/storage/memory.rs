//! In-process memory backend (`memory://bucket/key`).
//!
//! Buckets live for the lifetime of the process and are shared by name, so
//! every provider opened on `memory://raw` sees the same objects. Used for
//! tests and dry runs.

use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::{BackendConfig, StorageProvider};

/// In-memory bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub bucket: String,
    pub key: Option<Path>,
}

static BUCKETS: LazyLock<Mutex<HashMap<String, Arc<InMemory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn bucket(name: &str) -> Arc<InMemory> {
    let mut buckets = BUCKETS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    buckets
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(InMemory::new()))
        .clone()
}

impl StorageProvider {
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let object_store: Arc<dyn ObjectStore> = bucket(&config.bucket);
        let canonical_url = match &config.key {
            Some(key) => format!("memory://{}/{key}", config.bucket),
            None => format!("memory://{}", config.bucket),
        };

        Self {
            config: BackendConfig::Memory(config),
            object_store,
            canonical_url,
            storage_options: HashMap::new(),
        }
    }
}
