//! On-disk schema cache keyed by connection parameters.

use crate::error::{PipelineError, Result};
use crate::schema::{DatabaseSchema, SchemaType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bumped whenever the cached layout changes.
pub const SCHEMA_CACHE_VERSION: &str = "1.0";

const FILE_PREFIX: &str = "schema_cache_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedSchema {
    pub connection_hash: String,
    pub discovery_time: DateTime<Utc>,
    pub schema_version: String,
    pub total_tables: usize,
    pub fact_tables: Vec<String>,
    pub dimension_tables: Vec<String>,
    pub schema_type: SchemaType,
    pub schema: DatabaseSchema,
}

impl CachedSchema {
    pub fn age_hours(&self) -> f64 {
        (Utc::now() - self.discovery_time).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedSchemaInfo {
    pub connection_hash: String,
    pub database: String,
    pub discovery_time: DateTime<Utc>,
    pub total_tables: usize,
    pub schema_type: SchemaType,
    pub age_hours: f64,
    pub path: PathBuf,
}

/// `k=v` pairs joined with `|` in key order, SHA-256, first 16 hex characters.
pub fn connection_hash(params: &BTreeMap<String, String>) -> String {
    let joined = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("|");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub struct SchemaCache {
    dir: PathBuf,
}

impl SchemaCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::Cache(format!("Cannot create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", FILE_PREFIX, hash))
    }

    fn read(path: &Path) -> Result<CachedSchema> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn cache_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_cache = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(FILE_PREFIX) && n.ends_with(".json"));
            if is_cache {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Cached schema for these parameters if present, readable, current and young enough.
    pub fn load(&self, params: &BTreeMap<String, String>, max_age_hours: f64) -> Option<CachedSchema> {
        let hash = connection_hash(params);
        let path = self.path_for(&hash);
        if !path.exists() {
            debug!("No schema cache for {}", hash);
            return None;
        }
        let cached = match Self::read(&path) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Error reading schema cache {}: {}", path.display(), e);
                return None;
            }
        };
        if cached.schema_version != SCHEMA_CACHE_VERSION {
            info!("Schema cache version mismatch, will refresh schema");
            return None;
        }
        let age = cached.age_hours();
        if age > max_age_hours {
            info!("Schema cache expired ({:.1}h old), will refresh schema", age);
            return None;
        }
        info!(
            "Loaded schema from cache ({:.1}h old): {} tables, {} fact, {} dimension, {} schema",
            age,
            cached.total_tables,
            cached.fact_tables.len(),
            cached.dimension_tables.len(),
            cached.schema_type
        );
        Some(cached)
    }

    pub fn is_valid(&self, params: &BTreeMap<String, String>, max_age_hours: f64) -> bool {
        self.load(params, max_age_hours).is_some()
    }

    /// Store a discovered schema; returns the connection hash.
    pub fn save(&self, params: &BTreeMap<String, String>, schema: &DatabaseSchema) -> Result<String> {
        let hash = connection_hash(params);
        let summary = schema.summary();
        let cached = CachedSchema {
            connection_hash: hash.clone(),
            discovery_time: Utc::now(),
            schema_version: SCHEMA_CACHE_VERSION.to_string(),
            total_tables: summary.total_tables,
            fact_tables: summary.fact_tables,
            dimension_tables: summary.dimension_tables,
            schema_type: summary.schema_type,
            schema: schema.clone(),
        };
        let path = self.path_for(&hash);
        fs::write(&path, serde_json::to_string_pretty(&cached)?)
            .map_err(|e| PipelineError::Cache(format!("Cannot write {}: {}", path.display(), e)))?;
        info!("Schema cached with {} tables at {}", cached.total_tables, path.display());
        Ok(hash)
    }

    /// Remove one cached schema, or all of them. Returns the number of files removed.
    pub fn clear(&self, params: Option<&BTreeMap<String, String>>) -> Result<usize> {
        let files = match params {
            Some(params) => {
                let path = self.path_for(&connection_hash(params));
                if path.exists() {
                    vec![path]
                } else {
                    Vec::new()
                }
            }
            None => self.cache_files()?,
        };
        for path in &files {
            fs::remove_file(path)?;
        }
        info!("Cleared {} schema cache files", files.len());
        Ok(files.len())
    }

    /// Every readable cached schema; unreadable files are skipped with a warning.
    pub fn info(&self) -> Result<Vec<CachedSchemaInfo>> {
        let mut entries = Vec::new();
        for path in self.cache_files()? {
            match Self::read(&path) {
                Ok(cached) => entries.push(CachedSchemaInfo {
                    age_hours: cached.age_hours(),
                    connection_hash: cached.connection_hash,
                    database: cached.schema.database,
                    discovery_time: cached.discovery_time,
                    total_tables: cached.total_tables,
                    schema_type: cached.schema_type,
                    path,
                }),
                Err(e) => warn!("Skipping unreadable schema cache {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::fixtures::banking_schema;

    fn params(server: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("server".to_string(), server.to_string());
        params.insert("database".to_string(), "banking".to_string());
        params
    }

    #[test]
    fn test_connection_hash() {
        let hash = connection_hash(&params("a"));
        assert_eq!(hash.len(), 16);
        assert_eq!(hash, connection_hash(&params("a")));
        assert_ne!(hash, connection_hash(&params("b")));

        let expected = hex::encode(Sha256::digest(b"database=banking|server=a"));
        assert_eq!(hash, expected[..16]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path().join("schema")).unwrap();
        let schema = banking_schema();

        let hash = cache.save(&params("a"), &schema).unwrap();
        assert!(cache.dir().join(format!("schema_cache_{}.json", hash)).exists());

        let cached = cache.load(&params("a"), 24.0).unwrap();
        assert_eq!(cached.schema, schema);
        assert_eq!(cached.total_tables, 4);
        assert_eq!(cached.schema_type, SchemaType::Star);
        assert!(cache.is_valid(&params("a"), 24.0));
        assert!(cache.load(&params("b"), 24.0).is_none());
    }

    #[test]
    fn test_expired_and_mismatched_versions_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path()).unwrap();
        let hash = cache.save(&params("a"), &banking_schema()).unwrap();
        let path = cache.path_for(&hash);

        let mut cached = SchemaCache::read(&path).unwrap();
        cached.discovery_time = Utc::now() - chrono::Duration::hours(30);
        fs::write(&path, serde_json::to_string(&cached).unwrap()).unwrap();
        assert!(!cache.is_valid(&params("a"), 24.0));
        assert!(cache.is_valid(&params("a"), 48.0));

        cached.discovery_time = Utc::now();
        cached.schema_version = "0.9".to_string();
        fs::write(&path, serde_json::to_string(&cached).unwrap()).unwrap();
        assert!(!cache.is_valid(&params("a"), 24.0));

        fs::write(&path, "{ not json").unwrap();
        assert!(cache.load(&params("a"), 24.0).is_none());
    }

    #[test]
    fn test_clear_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path()).unwrap();
        cache.save(&params("a"), &banking_schema()).unwrap();
        cache.save(&params("b"), &banking_schema()).unwrap();
        fs::write(dir.path().join("other.json"), "{}").unwrap();

        let info = cache.info().unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].database, "banking");

        assert_eq!(cache.clear(Some(&params("a"))).unwrap(), 1);
        assert_eq!(cache.clear(Some(&params("a"))).unwrap(), 0);
        assert_eq!(cache.clear(None).unwrap(), 1);
        assert!(dir.path().join("other.json").exists());
    }
}
