//! Query engine abstraction.
//!
//! The coordinator never builds SQL strings itself. Components describe what
//! they want as a typed [`Statement`] and hand it to a [`QueryEngine`] along
//! with a [`Session`] holding per-call configuration. Remote engines render
//! statements with [`sql`]; the embedded [`WarehouseEngine`] executes them
//! directly against object storage.

pub mod sql;
mod warehouse;

pub use warehouse::WarehouseEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sleet_core::{RetryPolicy, retry_with_backoff};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, TransientSnafu};
use crate::schema::{PartitionedTableDef, StagingTableDef};

/// Session key enabling inserts that derive partitions from the data.
pub const DYNAMIC_PARTITION: &str = "hive.exec.dynamic.partition";
/// Session key that must be `nonstrict` for a fully dynamic partition spec.
pub const DYNAMIC_PARTITION_MODE: &str = "hive.exec.dynamic.partition.mode";
/// Session key naming the query; output files are named after it.
pub const QUERY_ID: &str = "hive.query.id";

/// Trait for engines that execute catalog and data statements.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Execute one statement under the given session configuration.
    async fn execute(
        &self,
        session: &Session,
        statement: &Statement,
    ) -> Result<StatementResult, EngineError>;
}

/// A reference-counted query engine.
pub type QueryEngineRef = Arc<dyn QueryEngine>;

/// Execute a statement with a per-attempt deadline, retrying transient
/// failures under `policy`. A call that outlives `call_timeout` counts as a
/// transient failure.
pub async fn execute_with_retry(
    engine: &dyn QueryEngine,
    session: &Session,
    statement: &Statement,
    policy: &RetryPolicy,
    call_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<StatementResult, EngineError> {
    retry_with_backoff(
        policy,
        cancel,
        statement.verb(),
        EngineError::is_transient,
        || async move {
            match tokio::time::timeout(call_timeout, engine.execute(session, statement)).await {
                Ok(result) => result,
                Err(_) => TransientSnafu {
                    message: format!(
                        "{} timed out after {}s",
                        statement.verb(),
                        call_timeout.as_secs()
                    ),
                }
                .fail(),
            }
        },
    )
    .await
}

/// Configuration key-value pairs applied to one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    conf: BTreeMap<String, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a configuration value, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conf.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.conf.get(key).map(String::as_str)
    }

    /// True if `key` is set to `true` (case-insensitive).
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Whether inserts may derive every partition value from the data.
    pub fn allows_dynamic_partitions(&self) -> bool {
        self.is_enabled(DYNAMIC_PARTITION)
            && self
                .get(DYNAMIC_PARTITION_MODE)
                .is_some_and(|mode| mode.eq_ignore_ascii_case("nonstrict"))
    }

    pub fn conf(&self) -> &BTreeMap<String, String> {
        &self.conf
    }
}

/// A database, or a table qualified by its database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub database: Option<String>,
    pub name: String,
}

impl ObjectName {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            database: None,
            name: name.into(),
        }
    }

    pub fn table(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(database) => write!(f, "{database}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// What a catalog holds under a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogObject {
    Database { name: String },
    ExternalTable(StagingTableDef),
    PartitionedTable(PartitionedTableDef),
}

impl CatalogObject {
    /// Human-readable kind, for conflict messages.
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogObject::Database { .. } => "database",
            CatalogObject::ExternalTable(_) => "external table",
            CatalogObject::PartitionedTable(_) => "partitioned table",
        }
    }

    pub fn name(&self) -> ObjectName {
        match self {
            CatalogObject::Database { name } => ObjectName::database(name),
            CatalogObject::ExternalTable(def) => def.object_name(),
            CatalogObject::PartitionedTable(def) => def.object_name(),
        }
    }
}

/// `INSERT INTO target PARTITION (col) SELECT columns..., col FROM source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertSelect {
    pub target: ObjectName,
    pub source: ObjectName,
    /// Source columns written to the target's data columns, in order.
    pub columns: Vec<String>,
    /// Source column whose value picks each row's partition.
    pub partition_column: String,
}

/// A typed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
    },
    CreateExternalTable {
        def: StagingTableDef,
        if_not_exists: bool,
    },
    CreateTable {
        def: PartitionedTableDef,
        if_not_exists: bool,
    },
    Describe(ObjectName),
    InsertSelect(InsertSelect),
}

impl Statement {
    /// Short verb for logs and metrics.
    pub fn verb(&self) -> &'static str {
        match self {
            Statement::CreateDatabase { .. } => "create_database",
            Statement::CreateExternalTable { .. } => "create_external_table",
            Statement::CreateTable { .. } => "create_table",
            Statement::Describe(_) => "describe",
            Statement::InsertSelect(_) => "insert_select",
        }
    }
}

/// What a statement did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementResult {
    pub rows_affected: u64,
    /// Rows the engine could not write. Non-zero means nothing was written.
    pub failed_rows: u64,
    /// Partitions written, as `col=value`, sorted.
    pub partitions: Vec<String>,
    /// Source objects read, relative to the source table location, sorted.
    pub input_files: Vec<String>,
    /// For `Describe`: the object holding the name, if any.
    pub described: Option<CatalogObject>,
}
