//! Shared resources for multi-pipeline deployments.

mod pool;

pub use pool::{StoragePool, StoragePoolRef};
