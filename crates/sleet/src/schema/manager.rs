//! Converging the catalog to the configured definitions.
//!
//! Every operation describes the object first and only creates it when the
//! name is free. Creates are issued without `IF NOT EXISTS`, so a concurrent
//! creator that wins the race is reported as a conflict instead of being
//! silently accepted with a definition nobody compared.

use std::time::Duration;

use sleet_core::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PartitionedTableDef, StagingTableDef, is_identifier};
use crate::engine::{
    CatalogObject, ObjectName, QueryEngineRef, Session, Statement, StatementResult,
    execute_with_retry, sql,
};
use crate::error::{EngineError, SchemaError};

/// What an ensure operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Created,
    Unchanged,
}

/// Idempotent DDL against a query engine.
pub struct SchemaManager {
    engine: QueryEngineRef,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl SchemaManager {
    pub fn new(
        engine: QueryEngineRef,
        retry: RetryPolicy,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            retry,
            call_timeout,
            cancel,
        }
    }

    /// Create the database if absent.
    pub async fn ensure_database(&self, name: &str) -> Result<Convergence, SchemaError> {
        let object = ObjectName::database(name);
        if !is_identifier(name) {
            return Err(SchemaError::InvalidDefinition {
                name: name.to_string(),
                message: "database name is not a valid identifier".to_string(),
            });
        }

        match self.describe(&object).await? {
            Some(CatalogObject::Database { .. }) => Ok(Convergence::Unchanged),
            Some(other) => Err(kind_conflict(&object, "database", &other)),
            None => {
                self.create(
                    &object,
                    Statement::CreateDatabase {
                        name: name.to_string(),
                        if_not_exists: false,
                    },
                )
                .await
            }
        }
    }

    /// Create the external staging table if absent, or confirm it matches.
    pub async fn ensure_staging_table(
        &self,
        def: &StagingTableDef,
    ) -> Result<Convergence, SchemaError> {
        def.validate()?;
        let object = def.object_name();

        match self.describe(&object).await? {
            Some(CatalogObject::ExternalTable(existing)) => {
                unchanged_or_drift(&object, def.differences_from(&existing))
            }
            Some(other) => Err(kind_conflict(&object, "external table", &other)),
            None => {
                self.create(
                    &object,
                    Statement::CreateExternalTable {
                        def: def.clone(),
                        if_not_exists: false,
                    },
                )
                .await
            }
        }
    }

    /// Create the partitioned table if absent, or confirm it matches.
    pub async fn ensure_partitioned_table(
        &self,
        def: &PartitionedTableDef,
    ) -> Result<Convergence, SchemaError> {
        def.validate()?;
        let object = def.object_name();

        match self.describe(&object).await? {
            Some(CatalogObject::PartitionedTable(existing)) => {
                unchanged_or_drift(&object, def.differences_from(&existing))
            }
            Some(other) => Err(kind_conflict(&object, "partitioned table", &other)),
            None => {
                self.create(
                    &object,
                    Statement::CreateTable {
                        def: def.clone(),
                        if_not_exists: false,
                    },
                )
                .await
            }
        }
    }

    async fn describe(&self, object: &ObjectName) -> Result<Option<CatalogObject>, SchemaError> {
        let result = self
            .execute(object, &Statement::Describe(object.clone()))
            .await?;
        Ok(result.described)
    }

    async fn create(
        &self,
        object: &ObjectName,
        statement: Statement,
    ) -> Result<Convergence, SchemaError> {
        match self.execute(object, &statement).await {
            Ok(_) => {
                info!(object = %object, "Created");
                Ok(Convergence::Created)
            }
            Err(SchemaError::Engine {
                source: EngineError::AlreadyExists { .. },
                ..
            }) => Err(SchemaError::Conflict {
                name: object.to_string(),
                message: "created concurrently by another writer".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        object: &ObjectName,
        statement: &Statement,
    ) -> Result<StatementResult, SchemaError> {
        debug!(sql = %sql::render(statement), "Schema statement");
        execute_with_retry(
            self.engine.as_ref(),
            &Session::new(),
            statement,
            &self.retry,
            self.call_timeout,
            &self.cancel,
        )
        .await
        .map_err(|source| SchemaError::Engine {
            name: object.to_string(),
            source,
        })
    }
}

fn unchanged_or_drift(
    object: &ObjectName,
    differences: Vec<String>,
) -> Result<Convergence, SchemaError> {
    if differences.is_empty() {
        debug!(object = %object, "Definition unchanged");
        Ok(Convergence::Unchanged)
    } else {
        Err(SchemaError::Drift {
            name: object.to_string(),
            differences,
        })
    }
}

fn kind_conflict(object: &ObjectName, wanted: &str, found: &CatalogObject) -> SchemaError {
    SchemaError::Conflict {
        name: object.to_string(),
        message: format!("held by an object of kind '{}', expected '{wanted}'", found.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{QueryEngine, WarehouseEngine};
    use crate::schema::{ColumnDef, ColumnType};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn staging(bucket: &str) -> StagingTableDef {
        StagingTableDef {
            database: "logistics".to_string(),
            name: "staging".to_string(),
            columns: vec![ColumnDef::string("delivery_id"), ColumnDef::string("date")],
            delimiter: ',',
            skip_header_lines: 1,
            location: format!("memory://{bucket}/raw/input_data"),
        }
    }

    fn target(bucket: &str) -> PartitionedTableDef {
        PartitionedTableDef {
            database: "logistics".to_string(),
            name: "by_date".to_string(),
            columns: vec![ColumnDef::string("delivery_id")],
            partition_column: ColumnDef::string("date"),
            location: format!("memory://{bucket}/warehouse/logistics.db/by_date"),
        }
    }

    fn manager(engine: QueryEngineRef) -> SchemaManager {
        SchemaManager::new(
            engine,
            RetryPolicy::default(),
            Duration::from_secs(10),
            CancellationToken::new(),
        )
    }

    async fn warehouse(bucket: &str) -> QueryEngineRef {
        Arc::new(
            WarehouseEngine::open(&format!("memory://{bucket}/warehouse"), None, HashMap::new())
                .await
                .unwrap(),
        )
    }

    /// Engine that answers `Describe` from a fixed catalog and records creates.
    struct ScriptedEngine {
        catalog: Mutex<HashMap<String, CatalogObject>>,
        creates: Mutex<Vec<String>>,
        lose_create_race: bool,
    }

    impl ScriptedEngine {
        fn new(objects: Vec<CatalogObject>, lose_create_race: bool) -> Self {
            Self {
                catalog: Mutex::new(
                    objects
                        .into_iter()
                        .map(|o| (o.name().to_string(), o))
                        .collect(),
                ),
                creates: Mutex::new(Vec::new()),
                lose_create_race,
            }
        }
    }

    #[async_trait]
    impl QueryEngine for ScriptedEngine {
        async fn execute(
            &self,
            _session: &Session,
            statement: &Statement,
        ) -> Result<StatementResult, EngineError> {
            match statement {
                Statement::Describe(name) => Ok(StatementResult {
                    described: self.catalog.lock().unwrap().get(&name.to_string()).cloned(),
                    ..Default::default()
                }),
                other => {
                    self.creates.lock().unwrap().push(other.verb().to_string());
                    if self.lose_create_race {
                        Err(EngineError::AlreadyExists {
                            name: "raced".to_string(),
                        })
                    } else {
                        Ok(StatementResult::default())
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let bucket = "schema-test-idempotent";
        let manager = manager(warehouse(bucket).await);

        assert_eq!(
            manager.ensure_database("logistics").await.unwrap(),
            Convergence::Created
        );
        assert_eq!(
            manager.ensure_staging_table(&staging(bucket)).await.unwrap(),
            Convergence::Created
        );
        assert_eq!(
            manager.ensure_partitioned_table(&target(bucket)).await.unwrap(),
            Convergence::Created
        );

        assert_eq!(
            manager.ensure_database("logistics").await.unwrap(),
            Convergence::Unchanged
        );
        assert_eq!(
            manager.ensure_staging_table(&staging(bucket)).await.unwrap(),
            Convergence::Unchanged
        );
        assert_eq!(
            manager.ensure_partitioned_table(&target(bucket)).await.unwrap(),
            Convergence::Unchanged
        );
    }

    #[tokio::test]
    async fn test_changed_definition_is_drift() {
        let bucket = "schema-test-drift";
        let manager = manager(warehouse(bucket).await);
        manager.ensure_database("logistics").await.unwrap();
        manager.ensure_staging_table(&staging(bucket)).await.unwrap();

        let mut changed = staging(bucket);
        changed.columns[0].data_type = ColumnType::Bigint;
        changed.skip_header_lines = 0;

        let err = manager.ensure_staging_table(&changed).await.unwrap_err();
        let SchemaError::Drift { differences, .. } = err else {
            panic!("expected drift, got {err:?}");
        };
        assert_eq!(differences.len(), 2);
        assert!(!SchemaError::Drift { name: String::new(), differences }.is_transient());
    }

    #[tokio::test]
    async fn test_other_kind_is_conflict() {
        let bucket = "schema-test-kind";
        let manager = manager(warehouse(bucket).await);
        manager.ensure_database("logistics").await.unwrap();
        manager.ensure_staging_table(&staging(bucket)).await.unwrap();

        let mut same_name = target(bucket);
        same_name.name = "staging".to_string();
        let err = manager
            .ensure_partitioned_table(&same_name)
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { .. }), "{err:?}");
        assert!(err.to_string().contains("kind 'external table'"));
    }

    #[tokio::test]
    async fn test_database_name_held_by_other_kind() {
        let engine = Arc::new(ScriptedEngine::new(vec![], false));
        engine.catalog.lock().unwrap().insert(
            "logistics".to_string(),
            CatalogObject::ExternalTable(staging("schema-test-scripted")),
        );
        let manager = manager(engine.clone());

        let err = manager.ensure_database("logistics").await.unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { .. }));
        assert!(engine.creates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_create_race_is_conflict() {
        let engine = Arc::new(ScriptedEngine::new(vec![], true));
        let manager = manager(engine.clone());

        let err = manager.ensure_database("logistics").await.unwrap_err();
        let SchemaError::Conflict { message, .. } = err else {
            panic!("expected conflict, got {err:?}");
        };
        assert!(message.contains("concurrently"));
        assert_eq!(*engine.creates.lock().unwrap(), vec!["create_database"]);
    }

    #[tokio::test]
    async fn test_invalid_definition_never_reaches_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec![], false));
        let manager = manager(engine.clone());

        let mut bad = staging("schema-test-invalid");
        bad.columns.clear();
        let err = manager.ensure_staging_table(&bad).await.unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefinition { .. }));
        assert!(engine.creates.lock().unwrap().is_empty());
    }
}
