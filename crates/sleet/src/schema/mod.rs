//! Table definitions and the manager that converges the catalog to them.

mod definition;
mod manager;

pub use definition::{
    ColumnDef, ColumnType, PartitionedTableDef, StagingTableDef, is_identifier,
};
pub use manager::{Convergence, SchemaManager};
