//! Fingerprinted memoization of finished analyses, owned by one engine.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AnalysisOptions;
use crate::error::EngineError;
use crate::models::AnalysisResult;

/// Share of the memory ceiling at which half of the entries are dropped.
const PRESSURE_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: AnalysisResult,
    pub size_bytes: usize,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Results too large to keep.
    pub rejected: u64,
}

/// Identity of a (file version, options) pair: SHA-256 over path, size,
/// mtime and the options serialized with sorted keys.
pub fn cache_key(path: &str, size: u64, mtime: Option<i64>, options: &AnalysisOptions) -> Result<String, EngineError> {
    // serde_json::Value maps are ordered, so the options JSON is key-sorted
    let fingerprint = serde_json::json!({
        "path": path,
        "size": size,
        "mtime": mtime,
        "options": serde_json::to_value(options)?,
    });
    let digest = Sha256::digest(fingerprint.to_string().as_bytes());
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

pub struct AnalysisCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    stats: Mutex<CacheStats>,
    max_entry_bytes: usize,
    memory_ceiling: u64,
}

impl AnalysisCache {
    pub fn new(capacity: usize, max_entry_bytes: usize, memory_ceiling: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(CacheStats { capacity: capacity.get(), ..Default::default() }),
            max_entry_bytes,
            memory_ceiling,
        }
    }

    pub fn from_options(options: &AnalysisOptions) -> Self {
        Self::new(options.cache_size, options.max_cache_entry_bytes, options.cache_memory_ceiling)
    }

    /// Returns a copy of the cached result tagged as a cache hit.
    pub fn get(&self, key: &str) -> Option<AnalysisResult> {
        let mut entries = self.entries.lock();
        let mut stats = self.stats.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Utc::now();
                stats.hits += 1;
                let mut result = entry.result.clone();
                if let Some(performance) = result.performance.as_mut() {
                    performance.cache_hit = true;
                }
                Some(result)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Stores a result unless its serialized form exceeds the per-entry
    /// ceiling. Capacity eviction is least-recently-used; memory pressure
    /// drops the older half first.
    pub fn put(&self, key: String, result: &AnalysisResult) -> Result<(), EngineError> {
        let size_bytes = serde_json::to_vec(result)
            .map_err(|e| EngineError::CacheWriteFailure(e.to_string()))?
            .len();
        let mut entries = self.entries.lock();
        let mut stats = self.stats.lock();

        if size_bytes > self.max_entry_bytes {
            stats.rejected += 1;
            tracing::debug!("Result of {} bytes is too large to cache", size_bytes);
            return Ok(());
        }

        let projected = stats.bytes + size_bytes as u64;
        if projected as f64 > self.memory_ceiling as f64 * PRESSURE_RATIO && !entries.is_empty() {
            let evict = (entries.len() + 1) / 2;
            for _ in 0..evict {
                if let Some((_, old)) = entries.pop_lru() {
                    stats.bytes = stats.bytes.saturating_sub(old.size_bytes as u64);
                    stats.evictions += 1;
                }
            }
            tracing::info!("Cache under memory pressure, evicted {} entries", evict);
        }

        let now = Utc::now();
        let entry = CacheEntry { result: result.clone(), size_bytes, inserted_at: now, last_access: now };
        if let Some((old_key, old)) = entries.push(key.clone(), entry) {
            stats.bytes = stats.bytes.saturating_sub(old.size_bytes as u64);
            if old_key != key {
                stats.evictions += 1;
            }
        }
        stats.bytes += size_bytes as u64;
        stats.entries = entries.len();
        Ok(())
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        let mut stats = self.stats.lock();
        stats.entries = 0;
        stats.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let mut stats = self.stats.lock().clone();
        stats.entries = entries.len();
        stats
    }

    pub fn bytes(&self) -> u64 {
        self.stats.lock().bytes
    }
}
