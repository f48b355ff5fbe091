//! Typed table definitions.
//!
//! Definitions are plain data. They are validated before any remote call and
//! compared field by field against what the catalog already holds, so drift
//! is reported as a list of concrete differences.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::engine::ObjectName;
use crate::error::SchemaError;

/// Column types understood by the delimited-text tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    String,
    Int,
    Bigint,
    Double,
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    /// HiveQL spelling of the type.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Int => "INT",
            ColumnType::Bigint => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)
    }
}

/// External, schema-on-read table over delimited files in a raw location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTableDef {
    pub database: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub delimiter: char,
    pub skip_header_lines: u32,
    /// URL of the directory holding the raw files.
    pub location: String,
}

impl StagingTableDef {
    pub fn object_name(&self) -> ObjectName {
        ObjectName::table(&self.database, &self.name)
    }

    pub fn qualified_name(&self) -> String {
        self.object_name().to_string()
    }

    /// Reject definitions the engine could never accept.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let name = self.qualified_name();
        check_identifier(&name, "database", &self.database)?;
        check_identifier(&name, "table", &self.name)?;
        check_columns(&name, &self.columns)?;
        if !self.delimiter.is_ascii() || matches!(self.delimiter, '\n' | '\r' | '"') {
            return invalid(
                &name,
                format!("delimiter {:?} must be a single ASCII character", self.delimiter),
            );
        }
        if self.location.is_empty() {
            return invalid(&name, "location is empty".to_string());
        }
        Ok(())
    }

    /// Differences between `existing` and this definition, empty if identical.
    pub fn differences_from(&self, existing: &StagingTableDef) -> Vec<String> {
        let mut differences = diff_columns(&existing.columns, &self.columns);
        if existing.delimiter != self.delimiter {
            differences.push(format!(
                "delimiter {:?} -> {:?}",
                existing.delimiter, self.delimiter
            ));
        }
        if existing.skip_header_lines != self.skip_header_lines {
            differences.push(format!(
                "skip.header.line.count {} -> {}",
                existing.skip_header_lines, self.skip_header_lines
            ));
        }
        if existing.location.trim_end_matches('/') != self.location.trim_end_matches('/') {
            differences.push(format!(
                "location {} -> {}",
                existing.location, self.location
            ));
        }
        differences
    }
}

/// Managed table partitioned by one string-like column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedTableDef {
    pub database: String,
    pub name: String,
    /// Data columns, in file order. Never contains the partition column.
    pub columns: Vec<ColumnDef>,
    pub partition_column: ColumnDef,
    /// URL of the table root; partitions live below it as `col=value/`.
    pub location: String,
}

impl PartitionedTableDef {
    pub fn object_name(&self) -> ObjectName {
        ObjectName::table(&self.database, &self.name)
    }

    pub fn qualified_name(&self) -> String {
        self.object_name().to_string()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let name = self.qualified_name();
        check_identifier(&name, "database", &self.database)?;
        check_identifier(&name, "table", &self.name)?;
        check_columns(&name, &self.columns)?;
        check_identifier(&name, "partition column", &self.partition_column.name)?;
        if !matches!(
            self.partition_column.data_type,
            ColumnType::String | ColumnType::Date
        ) {
            return invalid(
                &name,
                format!(
                    "partition column '{}' must be STRING or DATE, not {}",
                    self.partition_column.name, self.partition_column.data_type
                ),
            );
        }
        if self
            .columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&self.partition_column.name))
        {
            return invalid(
                &name,
                format!(
                    "partition column '{}' is also a data column",
                    self.partition_column.name
                ),
            );
        }
        if self.location.is_empty() {
            return invalid(&name, "location is empty".to_string());
        }
        Ok(())
    }

    pub fn differences_from(&self, existing: &PartitionedTableDef) -> Vec<String> {
        let mut differences = diff_columns(&existing.columns, &self.columns);
        if existing.partition_column != self.partition_column {
            differences.push(format!(
                "partition column {} -> {}",
                existing.partition_column, self.partition_column
            ));
        }
        if existing.location.trim_end_matches('/') != self.location.trim_end_matches('/') {
            differences.push(format!(
                "location {} -> {}",
                existing.location, self.location
            ));
        }
        differences
    }
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(name: &str, message: String) -> Result<(), SchemaError> {
    Err(SchemaError::InvalidDefinition {
        name: name.to_string(),
        message,
    })
}

fn check_identifier(name: &str, what: &str, value: &str) -> Result<(), SchemaError> {
    if is_identifier(value) {
        Ok(())
    } else {
        invalid(name, format!("{what} name '{value}' is not a valid identifier"))
    }
}

fn check_columns(name: &str, columns: &[ColumnDef]) -> Result<(), SchemaError> {
    if columns.is_empty() {
        return invalid(name, "no columns".to_string());
    }
    let mut seen = HashSet::new();
    for column in columns {
        check_identifier(name, "column", &column.name)?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return invalid(name, format!("duplicate column '{}'", column.name));
        }
    }
    Ok(())
}

fn diff_columns(existing: &[ColumnDef], desired: &[ColumnDef]) -> Vec<String> {
    let mut differences = Vec::new();

    for column in desired {
        match existing.iter().find(|c| c.name == column.name) {
            None => differences.push(format!("column {column} added")),
            Some(old) if old.data_type != column.data_type => differences.push(format!(
                "column {} type {} -> {}",
                column.name, old.data_type, column.data_type
            )),
            Some(_) => {}
        }
    }
    for column in existing {
        if !desired.iter().any(|c| c.name == column.name) {
            differences.push(format!("column {column} removed"));
        }
    }

    if differences.is_empty() {
        let old: Vec<&str> = existing.iter().map(|c| c.name.as_str()).collect();
        let new: Vec<&str> = desired.iter().map(|c| c.name.as_str()).collect();
        if old != new {
            differences.push(format!(
                "column order ({}) -> ({})",
                old.join(", "),
                new.join(", ")
            ));
        }
    }
    differences
}
