//! HiveQL rendering of typed statements.
//!
//! Used for logging by every engine and as the wire format for engines that
//! take SQL text.

use std::fmt::Write;

use super::{InsertSelect, Session, Statement};
use crate::schema::ColumnDef;

/// Render a statement as HiveQL, without a trailing semicolon.
pub fn render(statement: &Statement) -> String {
    match statement {
        Statement::CreateDatabase {
            name,
            if_not_exists,
        } => format!("CREATE DATABASE {}{name}", if_not_exists_clause(*if_not_exists)),
        Statement::CreateExternalTable { def, if_not_exists } => {
            let mut sql = format!(
                "CREATE EXTERNAL TABLE {}{} ({})",
                if_not_exists_clause(*if_not_exists),
                def.qualified_name(),
                column_list(&def.columns)
            );
            let _ = write!(
                sql,
                " ROW FORMAT DELIMITED FIELDS TERMINATED BY '{}' STORED AS TEXTFILE LOCATION '{}'",
                escape(&def.delimiter.to_string()),
                escape(&def.location)
            );
            if def.skip_header_lines > 0 {
                let _ = write!(
                    sql,
                    " TBLPROPERTIES ('skip.header.line.count'='{}')",
                    def.skip_header_lines
                );
            }
            sql
        }
        Statement::CreateTable { def, if_not_exists } => format!(
            "CREATE TABLE {}{} ({}) PARTITIONED BY ({}) ROW FORMAT DELIMITED FIELDS TERMINATED BY ',' STORED AS TEXTFILE LOCATION '{}'",
            if_not_exists_clause(*if_not_exists),
            def.qualified_name(),
            column_list(&def.columns),
            def.partition_column,
            escape(&def.location)
        ),
        Statement::Describe(name) => format!("DESCRIBE FORMATTED {name}"),
        Statement::InsertSelect(insert) => render_insert(insert),
    }
}

/// Render session configuration as `SET` statements, in key order.
pub fn render_session(session: &Session) -> Vec<String> {
    session
        .conf()
        .iter()
        .map(|(key, value)| format!("SET {key}={value}"))
        .collect()
}

/// Render a whole script: session settings followed by the statement.
pub fn render_script(session: &Session, statement: &Statement) -> String {
    let mut lines = render_session(session);
    lines.push(render(statement));
    lines.join(";\n") + ";"
}

fn render_insert(insert: &InsertSelect) -> String {
    let mut select: Vec<&str> = insert.columns.iter().map(String::as_str).collect();
    select.push(&insert.partition_column);
    format!(
        "INSERT INTO TABLE {} PARTITION ({}) SELECT {} FROM {}",
        insert.target,
        insert.partition_column,
        select.join(", "),
        insert.source
    )
}

fn if_not_exists_clause(if_not_exists: bool) -> &'static str {
    if if_not_exists { "IF NOT EXISTS " } else { "" }
}

fn column_list(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
