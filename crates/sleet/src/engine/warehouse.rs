//! Embedded engine over object storage.
//!
//! The catalog is one JSON document per object under `_catalog/` in the
//! warehouse root, created with a conditional put so two creators of the same
//! name cannot both win. External tables are read as delimited text from
//! their location; partitioned tables are written in Hive layout:
//!
//! ```text
//! {location}/{partition_column}={value}/part-{query_id}-00000.csv
//! ```
//!
//! Output file names depend only on the query id and partition, so
//! re-running an insert with the same query id overwrites its own output.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use object_store::path::Path;
use sleet_core::{StoragePoolRef, StorageProviderRef, get_or_create_storage};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::{
    CatalogObject, InsertSelect, ObjectName, QUERY_ID, QueryEngine, Session, Statement,
    StatementResult, sql,
};
use crate::error::{CatalogSnafu, DelimitedSnafu, EngineError, SemanticSnafu, StorageSnafu};
use crate::schema::{PartitionedTableDef, StagingTableDef};
use crate::store::is_data_object;

const CATALOG_DIR: &str = "_catalog";

/// Query engine that keeps its catalog and tables in object storage.
pub struct WarehouseEngine {
    warehouse: StorageProviderRef,
    pool: Option<StoragePoolRef>,
    storage_options: HashMap<String, String>,
}

impl WarehouseEngine {
    /// Open the warehouse rooted at `warehouse_uri`.
    pub async fn open(
        warehouse_uri: &str,
        pool: Option<&StoragePoolRef>,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, EngineError> {
        let warehouse = get_or_create_storage(pool, warehouse_uri, storage_options.clone())
            .await
            .context(StorageSnafu)?;
        Ok(Self {
            warehouse,
            pool: pool.cloned(),
            storage_options,
        })
    }

    fn catalog_path(name: &ObjectName) -> Path {
        Path::from(format!("{CATALOG_DIR}/{name}.json"))
    }

    async fn lookup(&self, name: &ObjectName) -> Result<Option<CatalogObject>, EngineError> {
        let bytes = match self.warehouse.get(&Self::catalog_path(name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(EngineError::Storage { source }),
        };
        let object = serde_json::from_slice(&bytes).context(CatalogSnafu {
            name: name.to_string(),
        })?;
        Ok(Some(object))
    }

    async fn create(
        &self,
        object: CatalogObject,
        if_not_exists: bool,
    ) -> Result<StatementResult, EngineError> {
        let name = object.name();

        if let Some(database) = &name.database
            && self.lookup(&ObjectName::database(database)).await?.is_none()
        {
            return Err(EngineError::NotFound {
                name: database.clone(),
            });
        }

        let body = serde_json::to_vec_pretty(&object).context(CatalogSnafu {
            name: name.to_string(),
        })?;

        match self
            .warehouse
            .put_if_absent(&Self::catalog_path(&name), Bytes::from(body))
            .await
        {
            Ok(()) => {
                info!(object = %name, kind = object.kind(), "Registered catalog object");
                Ok(StatementResult::default())
            }
            Err(e) if e.is_already_exists() && if_not_exists => Ok(StatementResult::default()),
            Err(e) if e.is_already_exists() => Err(EngineError::AlreadyExists {
                name: name.to_string(),
            }),
            Err(source) => Err(EngineError::Storage { source }),
        }
    }

    async fn open_location(&self, url: &str) -> Result<StorageProviderRef, EngineError> {
        get_or_create_storage(self.pool.as_ref(), url, self.storage_options.clone())
            .await
            .context(StorageSnafu)
    }

    async fn source_table(&self, name: &ObjectName) -> Result<StagingTableDef, EngineError> {
        match self.lookup(name).await? {
            Some(CatalogObject::ExternalTable(def)) => Ok(def),
            Some(other) => Err(EngineError::Semantic {
                message: format!("{name} is a {}, not an external table", other.kind()),
            }),
            None => Err(EngineError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn target_table(&self, name: &ObjectName) -> Result<PartitionedTableDef, EngineError> {
        match self.lookup(name).await? {
            Some(CatalogObject::PartitionedTable(def)) => Ok(def),
            Some(other) => Err(EngineError::Semantic {
                message: format!("{name} is a {}, not a partitioned table", other.kind()),
            }),
            None => Err(EngineError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn insert_select(
        &self,
        session: &Session,
        insert: &InsertSelect,
    ) -> Result<StatementResult, EngineError> {
        if !session.allows_dynamic_partitions() {
            return SemanticSnafu {
                message: "dynamic partition insert requires hive.exec.dynamic.partition=true \
                          and hive.exec.dynamic.partition.mode=nonstrict",
            }
            .fail();
        }

        let source = self.source_table(&insert.source).await?;
        let target = self.target_table(&insert.target).await?;
        let projection = Projection::resolve(insert, &source, &target)?;

        let scan = self.scan(&source, &projection).await?;
        let mut result = StatementResult {
            input_files: scan.input_files,
            failed_rows: scan.failed_rows,
            ..Default::default()
        };

        if scan.failed_rows > 0 {
            info!(
                target_table = %insert.target,
                failed_rows = scan.failed_rows,
                "Insert rejected, nothing written"
            );
            return Ok(result);
        }

        let query_id = session
            .get(QUERY_ID)
            .map(str::to_string)
            .unwrap_or_else(|| format!("sleet_{}", Utc::now().format("%Y%m%d%H%M%S%6f")));

        let output = self.open_location(&target.location).await?;
        let column = &target.partition_column.name;
        for (value, rows) in &scan.partitions {
            let partition = format!("{column}={value}");
            let path = Path::from(format!("{partition}/part-{query_id}-{:05}.csv", 0));
            let body = encode_rows(rows).context(DelimitedSnafu {
                path: path.to_string(),
            })?;
            output.put(&path, body).await.context(StorageSnafu)?;

            debug!(partition = %partition, rows = rows.len(), "Wrote partition file");
            result.rows_affected += rows.len() as u64;
            result.partitions.push(partition);
        }

        Ok(result)
    }

    async fn scan(
        &self,
        source: &StagingTableDef,
        projection: &Projection,
    ) -> Result<Scan, EngineError> {
        let input = self.open_location(&source.location).await?;
        let objects = input.list_with_prefix("").await.context(StorageSnafu)?;

        let mut scan = Scan::default();
        for meta in objects {
            if !is_data_object(meta.location.as_ref()) {
                continue;
            }
            let bytes = input.get(&meta.location).await.context(StorageSnafu)?;
            let path = meta.location.to_string();

            let mut reader = csv::ReaderBuilder::new()
                .delimiter(source.delimiter as u8)
                .has_headers(false)
                .flexible(true)
                .from_reader(bytes.as_ref());

            for (index, record) in reader.records().enumerate() {
                let record = record.context(DelimitedSnafu { path: path.clone() })?;
                if index < source.skip_header_lines as usize {
                    continue;
                }
                match projection.apply(&record, source.columns.len()) {
                    Some((partition, row)) => {
                        scan.partitions.entry(partition).or_default().push(row);
                    }
                    None => scan.failed_rows += 1,
                }
            }
            scan.input_files.push(path);
        }

        Ok(scan)
    }
}

#[async_trait]
impl QueryEngine for WarehouseEngine {
    async fn execute(
        &self,
        session: &Session,
        statement: &Statement,
    ) -> Result<StatementResult, EngineError> {
        debug!(sql = %sql::render(statement), "Executing statement");

        match statement {
            Statement::CreateDatabase {
                name,
                if_not_exists,
            } => {
                self.create(CatalogObject::Database { name: name.clone() }, *if_not_exists)
                    .await
            }
            Statement::CreateExternalTable { def, if_not_exists } => {
                self.create(CatalogObject::ExternalTable(def.clone()), *if_not_exists)
                    .await
            }
            Statement::CreateTable { def, if_not_exists } => {
                self.create(CatalogObject::PartitionedTable(def.clone()), *if_not_exists)
                    .await
            }
            Statement::Describe(name) => Ok(StatementResult {
                described: self.lookup(name).await?,
                ..Default::default()
            }),
            Statement::InsertSelect(insert) => self.insert_select(session, insert).await,
        }
    }
}

/// Rows read from the source, grouped by partition value.
#[derive(Default)]
struct Scan {
    partitions: BTreeMap<String, Vec<Vec<String>>>,
    failed_rows: u64,
    input_files: Vec<String>,
}

/// Source column positions feeding the target.
struct Projection {
    columns: Vec<usize>,
    partition: usize,
}

impl Projection {
    fn resolve(
        insert: &InsertSelect,
        source: &StagingTableDef,
        target: &PartitionedTableDef,
    ) -> Result<Self, EngineError> {
        ensure!(
            insert.partition_column == target.partition_column.name,
            SemanticSnafu {
                message: format!(
                    "{} is partitioned by {}, not {}",
                    insert.target, target.partition_column.name, insert.partition_column
                ),
            }
        );
        ensure!(
            insert.columns.len() == target.columns.len(),
            SemanticSnafu {
                message: format!(
                    "{} has {} data column(s) but the select produces {}",
                    insert.target,
                    target.columns.len(),
                    insert.columns.len()
                ),
            }
        );

        let position = |name: &str| {
            source
                .columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| EngineError::Semantic {
                    message: format!("column {name} not found in {}", insert.source),
                })
        };

        Ok(Self {
            columns: insert
                .columns
                .iter()
                .map(|name| position(name))
                .collect::<Result<_, _>>()?,
            partition: position(&insert.partition_column)?,
        })
    }

    /// Project one record, or `None` if it cannot be written.
    fn apply(&self, record: &csv::StringRecord, width: usize) -> Option<(String, Vec<String>)> {
        if record.len() != width {
            return None;
        }
        let partition = record.get(self.partition)?.trim();
        if !is_valid_partition_value(partition) {
            return None;
        }
        let row = self
            .columns
            .iter()
            .map(|&i| record.get(i).unwrap_or_default().to_string())
            .collect();
        Some((partition.to_string(), row))
    }
}

fn is_valid_partition_value(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.chars().any(|c| c == '/' || c.is_control())
}

fn encode_rows(rows: &[Vec<String>]) -> Result<Bytes, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    let body = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DYNAMIC_PARTITION, DYNAMIC_PARTITION_MODE};
    use crate::schema::ColumnDef;

    fn staging(bucket: &str) -> StagingTableDef {
        StagingTableDef {
            database: "logistics".to_string(),
            name: "staging".to_string(),
            columns: vec![
                ColumnDef::string("delivery_id"),
                ColumnDef::string("weight"),
                ColumnDef::string("date"),
            ],
            delimiter: ',',
            skip_header_lines: 1,
            location: format!("memory://{bucket}/raw/input_data"),
        }
    }

    fn target(bucket: &str) -> PartitionedTableDef {
        PartitionedTableDef {
            database: "logistics".to_string(),
            name: "by_date".to_string(),
            columns: vec![ColumnDef::string("delivery_id"), ColumnDef::string("weight")],
            partition_column: ColumnDef::string("date"),
            location: format!("memory://{bucket}/warehouse/logistics.db/by_date"),
        }
    }

    fn insert() -> Statement {
        Statement::InsertSelect(InsertSelect {
            target: ObjectName::table("logistics", "by_date"),
            source: ObjectName::table("logistics", "staging"),
            columns: vec!["delivery_id".to_string(), "weight".to_string()],
            partition_column: "date".to_string(),
        })
    }

    fn dynamic(query_id: &str) -> Session {
        Session::new()
            .with(DYNAMIC_PARTITION, "true")
            .with(DYNAMIC_PARTITION_MODE, "nonstrict")
            .with(QUERY_ID, query_id)
    }

    async fn setup(bucket: &str) -> WarehouseEngine {
        let engine = WarehouseEngine::open(
            &format!("memory://{bucket}/warehouse"),
            None,
            HashMap::new(),
        )
        .await
        .unwrap();
        let session = Session::new();
        for statement in [
            Statement::CreateDatabase {
                name: "logistics".to_string(),
                if_not_exists: false,
            },
            Statement::CreateExternalTable {
                def: staging(bucket),
                if_not_exists: false,
            },
            Statement::CreateTable {
                def: target(bucket),
                if_not_exists: false,
            },
        ] {
            engine.execute(&session, &statement).await.unwrap();
        }
        engine
    }

    async fn put(url: &str, key: &str, body: &'static str) {
        let store = sleet_core::StorageProvider::for_url(url).await.unwrap();
        store
            .put(&Path::from(key), Bytes::from_static(body.as_bytes()))
            .await
            .unwrap();
    }

    async fn read(url: &str, key: &str) -> String {
        let store = sleet_core::StorageProvider::for_url(url).await.unwrap();
        let bytes = store.get(&Path::from(key)).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_describe() {
        let engine = setup("wh-test-describe").await;
        let result = engine
            .execute(
                &Session::new(),
                &Statement::Describe(ObjectName::table("logistics", "staging")),
            )
            .await
            .unwrap();
        assert_eq!(
            result.described,
            Some(CatalogObject::ExternalTable(staging("wh-test-describe")))
        );

        let missing = engine
            .execute(
                &Session::new(),
                &Statement::Describe(ObjectName::table("logistics", "nope")),
            )
            .await
            .unwrap();
        assert_eq!(missing.described, None);
    }

    #[tokio::test]
    async fn test_create_existing_fails_unless_if_not_exists() {
        let engine = setup("wh-test-exists").await;
        let err = engine
            .execute(
                &Session::new(),
                &Statement::CreateDatabase {
                    name: "logistics".to_string(),
                    if_not_exists: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));

        engine
            .execute(
                &Session::new(),
                &Statement::CreateDatabase {
                    name: "logistics".to_string(),
                    if_not_exists: true,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_table_requires_database() {
        let engine = WarehouseEngine::open("memory://wh-test-nodb/warehouse", None, HashMap::new())
            .await
            .unwrap();
        let err = engine
            .execute(
                &Session::new(),
                &Statement::CreateExternalTable {
                    def: staging("wh-test-nodb"),
                    if_not_exists: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { name } if name == "logistics"));
    }

    #[tokio::test]
    async fn test_insert_requires_dynamic_partition_opt_in() {
        let engine = setup("wh-test-strict").await;
        let err = engine
            .execute(&Session::new(), &insert())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Semantic { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_insert_writes_hive_partitions() {
        let bucket = "wh-test-insert";
        let engine = setup(bucket).await;
        put(
            &format!("memory://{bucket}/raw"),
            "input_data/logistics_2024-01-01.csv",
            "delivery_id,weight,date\nd1,1.5,2024-01-01\nd2,2.0,2024-01-02\nd3,0.5,2024-01-01\n",
        )
        .await;
        put(&format!("memory://{bucket}/raw"), "input_data/_SUCCESS", "").await;

        let result = engine.execute(&dynamic("q1"), &insert()).await.unwrap();
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.failed_rows, 0);
        assert_eq!(result.partitions, vec!["date=2024-01-01", "date=2024-01-02"]);
        assert_eq!(result.input_files, vec!["logistics_2024-01-01.csv"]);

        let table = format!("memory://{bucket}/warehouse/logistics.db/by_date");
        assert_eq!(
            read(&table, "date=2024-01-01/part-q1-00000.csv").await,
            "d1,1.5\nd3,0.5\n"
        );
        assert_eq!(
            read(&table, "date=2024-01-02/part-q1-00000.csv").await,
            "d2,2.0\n"
        );
    }

    #[tokio::test]
    async fn test_same_query_id_overwrites() {
        let bucket = "wh-test-rerun";
        let engine = setup(bucket).await;
        put(
            &format!("memory://{bucket}/raw"),
            "input_data/a.csv",
            "delivery_id,weight,date\nd1,1,2024-01-01\n",
        )
        .await;

        engine.execute(&dynamic("run-1"), &insert()).await.unwrap();
        engine.execute(&dynamic("run-1"), &insert()).await.unwrap();

        let table = sleet_core::StorageProvider::for_url(&format!(
            "memory://{bucket}/warehouse/logistics.db/by_date"
        ))
        .await
        .unwrap();
        let files = table.list_with_prefix("date=2024-01-01/").await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_rows_make_insert_write_nothing() {
        let bucket = "wh-test-reject";
        let engine = setup(bucket).await;
        put(
            &format!("memory://{bucket}/raw"),
            "input_data/a.csv",
            "delivery_id,weight,date\nd1,1,2024-01-01\nd2,2\nd3,3,\n",
        )
        .await;

        let result = engine.execute(&dynamic("q"), &insert()).await.unwrap();
        assert_eq!(result.failed_rows, 2);
        assert_eq!(result.rows_affected, 0);
        assert!(result.partitions.is_empty());

        let table = sleet_core::StorageProvider::for_url(&format!(
            "memory://{bucket}/warehouse/logistics.db/by_date"
        ))
        .await
        .unwrap();
        assert!(table.list_with_prefix("").await.unwrap().is_empty());
    }

    #[test]
    fn test_partition_values() {
        assert!(is_valid_partition_value("2024-01-01"));
        assert!(!is_valid_partition_value(""));
        assert!(!is_valid_partition_value(".."));
        assert!(!is_valid_partition_value("a/b"));
    }
}
