//! TTL cache of pipeline results, one JSON file per question.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    cache_key: String,
    query: String,
    query_type: String,
    schema_hash: Option<String>,
    result: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub cleanups: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub disk_usage_bytes: u64,
}

/// What [`QueryCache::invalidate`] removes.
pub enum Invalidation<'a> {
    /// One question of one kind, for the given schema fingerprint.
    Query {
        query: &'a str,
        kind: &'a str,
        schema_hash: Option<&'a str>,
    },
    /// Every entry of a kind.
    Kind(&'a str),
    /// Every entry whose key contains the pattern.
    Pattern(&'a str),
}

pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// SHA-256 of `kind:normalized[:schema_hash]`.
pub fn cache_key(query: &str, kind: &str, schema_hash: Option<&str>) -> String {
    let mut input = format!("{}:{}", kind, normalize_query(query));
    if let Some(hash) = schema_hash {
        input.push(':');
        input.push_str(hash);
    }
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub struct QueryCache {
    dir: PathBuf,
    default_ttl: u64,
    stats: Mutex<CacheStats>,
}

impl QueryCache {
    pub fn new(dir: impl Into<PathBuf>, default_ttl: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::Cache(format!("Cannot create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            default_ttl,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn read(path: &Path) -> Result<CacheEntry> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Cached result with `from_cache` and `cache_timestamp` added. Expired entries are deleted.
    pub fn get(&self, query: &str, kind: &str, schema_hash: Option<&str>) -> Option<Value> {
        let key = cache_key(query, kind, schema_hash);
        let path = self.path_for(&key);
        if !path.exists() {
            self.record(|s| s.misses += 1);
            return None;
        }

        let entry = match Self::read(&path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error reading query cache entry {}: {}", key, e);
                self.record(|s| s.misses += 1);
                return None;
            }
        };
        if entry.expires_at <= Utc::now() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Cannot remove expired cache entry {}: {}", key, e);
            }
            self.record(|s| s.misses += 1);
            return None;
        }

        self.record(|s| s.hits += 1);
        debug!("Cache hit for {} query: {}", kind, key);
        let mut result = entry.result;
        if let Value::Object(map) = &mut result {
            map.insert("from_cache".to_string(), Value::Bool(true));
            map.insert("cache_timestamp".to_string(), Value::String(entry.created_at.to_rfc3339()));
        }
        Some(result)
    }

    /// Store a successful result. Returns `false` when the result is not marked successful.
    pub fn set<T: Serialize>(
        &self,
        query: &str,
        kind: &str,
        result: &T,
        ttl: Option<u64>,
        schema_hash: Option<&str>,
    ) -> Result<bool> {
        let result = serde_json::to_value(result)?;
        if result.get("success").and_then(Value::as_bool) != Some(true) {
            return Ok(false);
        }

        let key = cache_key(query, kind, schema_hash);
        let ttl = ttl.unwrap_or(self.default_ttl);
        let created_at = Utc::now();
        let entry = CacheEntry {
            cache_key: key.clone(),
            query: query.to_string(),
            query_type: kind.to_string(),
            schema_hash: schema_hash.map(str::to_string),
            result,
            created_at,
            expires_at: created_at + Duration::seconds(ttl as i64),
            ttl,
        };
        let path = self.path_for(&key);
        fs::write(&path, serde_json::to_string_pretty(&entry)?)
            .map_err(|e| PipelineError::Cache(format!("Cannot write {}: {}", path.display(), e)))?;
        debug!("Cached {} query result: {}", kind, key);
        Ok(true)
    }

    pub fn invalidate(&self, target: Invalidation<'_>) -> Result<usize> {
        let mut removed = 0;
        match target {
            Invalidation::Query {
                query,
                kind,
                schema_hash,
            } => {
                let path = self.path_for(&cache_key(query, kind, schema_hash));
                if path.exists() {
                    fs::remove_file(path)?;
                    removed = 1;
                }
            }
            Invalidation::Kind(kind) => {
                for path in self.entry_files()? {
                    let matches = Self::read(&path).map_or(false, |e| e.query_type.eq_ignore_ascii_case(kind));
                    if matches {
                        fs::remove_file(path)?;
                        removed += 1;
                    }
                }
            }
            Invalidation::Pattern(pattern) => {
                for path in self.entry_files()? {
                    let matches = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map_or(false, |n| n.contains(pattern));
                    if matches {
                        fs::remove_file(path)?;
                        removed += 1;
                    }
                }
            }
        }
        self.record(|s| s.invalidations += removed as u64);
        info!("Invalidated {} cache entries", removed);
        Ok(removed)
    }

    /// Remove expired and unreadable entries.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for path in self.entry_files()? {
            let remove = match Self::read(&path) {
                Ok(entry) => entry.expires_at <= now,
                Err(e) => {
                    warn!("Removing corrupted cache file {}: {}", path.display(), e);
                    true
                }
            };
            if remove {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        self.record(|s| s.cleanups += removed as u64);
        if removed > 0 {
            info!("Cleaned up {} expired cache entries", removed);
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let files = self.entry_files()?;
        for path in &files {
            fs::remove_file(path)?;
        }
        info!("Cleared all cache entries ({} files)", files.len());
        Ok(files.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = self.stats.lock().map(|s| *s).unwrap_or_default();
        let total = stats.hits + stats.misses;
        stats.hit_rate = if total > 0 {
            stats.hits as f64 / total as f64
        } else {
            0.0
        };
        let files = self.entry_files()?;
        stats.entries = files.len();
        stats.disk_usage_bytes = files
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        Ok(stats)
    }
}
