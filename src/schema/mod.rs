//! Schema metadata, discovery and prompt context.

pub mod context;
pub mod discovery;
pub mod model;

pub use context::{dax_context, map_sql_to_dax_type, sql_context};
pub use discovery::SchemaDiscovery;
pub use model::{ColumnInfo, DatabaseSchema, Relationship, SchemaSummary, SchemaType, TableInfo, TableKind};
