pub mod query_cache;
pub mod schema_cache;

pub use query_cache::{cache_key, CacheStats, Invalidation, QueryCache};
pub use schema_cache::{connection_hash, CachedSchema, CachedSchemaInfo, SchemaCache};
