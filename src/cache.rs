//! Prompt-fingerprinted response cache with TTL and LRU eviction.
//!
//! Successful worker results are memoized under a fingerprint computed
//! from the trimmed prompt and the canonical model name; nothing else a
//! caller passes changes the key. The index is bounded: every `get` or
//! `set` promotes its entry to most-recently-used, and a `set` that
//! overflows the bound evicts the least-recently-used entry. Expiry is
//! checked lazily on `get` and counted separately from evictions.
//!
//! The whole cache can be persisted to (and loaded from) a single
//! versioned JSON file; loading skips expired entries and malformed
//! input without complaint.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default entry lifetime.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Default bound on the number of cached entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

const PERSIST_VERSION: u32 = 1;

/// Stable fingerprint over the trimmed prompt and the model tag.
pub fn fingerprint(prompt: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// One memoized response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub prompt: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub model: Option<String>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Counters exposed by [`ResponseCache::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Bounded, TTL-aware memoization of worker responses.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    /// Fingerprints ordered least-recently-used first.
    lru: Vec<String>,
    max_entries: usize,
    default_ttl_secs: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize, default_ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            lru: Vec::new(),
            max_entries: max_entries.max(1),
            default_ttl_secs,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    /// Look up a response for the prompt/model pair. Promotes the entry to
    /// most-recently-used on a hit; removes it when it has expired.
    pub fn get(&mut self, prompt: &str, model: &str) -> Option<CacheEntry> {
        let key = fingerprint(prompt, model);
        match self.entries.get(&key).map(|e| (e.is_expired(), e.clone())) {
            None => {
                self.misses += 1;
                None
            }
            Some((true, _)) => {
                self.entries.remove(&key);
                self.lru.retain(|k| k != &key);
                self.expirations += 1;
                self.misses += 1;
                None
            }
            Some((false, entry)) => {
                self.touch(&key);
                self.hits += 1;
                Some(entry)
            }
        }
    }

    /// Store a response. A TTL override applies to this entry only.
    pub fn set(&mut self, prompt: &str, model: &str, response: &str, ttl_secs: Option<u64>) {
        let key = fingerprint(prompt, model);
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let now = Utc::now();
        let entry = CacheEntry {
            fingerprint: key.clone(),
            prompt: prompt.trim().to_string(),
            response: response.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl as i64),
            model: Some(model.to_string()),
        };

        let existed = self.entries.insert(key.clone(), entry).is_some();
        if existed {
            self.touch(&key);
        } else {
            self.lru.push(key);
            if self.entries.len() > self.max_entries {
                let victim = self.lru.remove(0);
                self.entries.remove(&victim);
                self.evictions += 1;
                debug!(fingerprint = %victim, "evicted least-recently-used entry");
            }
        }
    }

    /// True when an unexpired entry exists. Does not touch LRU order.
    pub fn has(&self, prompt: &str, model: &str) -> bool {
        let key = fingerprint(prompt, model);
        self.entries.get(&key).is_some_and(|e| !e.is_expired())
    }

    /// Drop one entry by fingerprint.
    pub fn invalidate(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.lru.retain(|k| k != key);
        }
        removed
    }

    /// Drop everything. Counters survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }

    /// Write the cache to a single versioned JSON file.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let doc = PersistDoc {
            version: PERSIST_VERSION,
            entries: self
                .lru
                .iter()
                .filter_map(|key| {
                    self.entries
                        .get(key)
                        .map(|entry| (key.clone(), entry.clone()))
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::filesystem(parent.display().to_string(), e.to_string()))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::filesystem(path.display().to_string(), e.to_string()))?;
        Ok(())
    }

    /// Load entries from a persisted file. Expired entries and malformed
    /// input are skipped silently; a missing file leaves the cache empty.
    pub async fn load(&mut self, path: &Path) -> Result<usize> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::filesystem(path.display().to_string(), e.to_string()));
            }
        };

        let doc: PersistDoc = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding malformed cache file");
                return Ok(0);
            }
        };

        if doc.version != PERSIST_VERSION {
            warn!(
                version = doc.version,
                "discarding cache file with unknown version"
            );
            return Ok(0);
        }

        let mut loaded = 0;
        for (key, entry) in doc.entries {
            if entry.is_expired() || entry.fingerprint != key {
                continue;
            }
            if self.entries.len() >= self.max_entries {
                break;
            }
            self.entries.insert(key.clone(), entry);
            self.lru.push(key);
            loaded += 1;
        }
        Ok(loaded)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            let key = self.lru.remove(pos);
            self.lru.push(key);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistDoc {
    version: u32,
    entries: Vec<(String, CacheEntry)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(
            fingerprint("  what is 2+2  \n", "gemini-2.5-flash"),
            fingerprint("what is 2+2", "gemini-2.5-flash")
        );
    }

    #[test]
    fn test_fingerprint_depends_on_model() {
        assert_ne!(
            fingerprint("what is 2+2", "gemini-2.5-flash"),
            fingerprint("what is 2+2", "gemini-2.5-pro")
        );
    }

    #[test]
    fn test_set_then_get() {
        let mut cache = ResponseCache::default();
        cache.set("prompt", "gemini-2.5-flash", "4", None);
        let entry = cache.get("prompt", "gemini-2.5-flash").unwrap();
        assert_eq!(entry.response, "4");
        assert!(entry.expires_at >= entry.created_at);
    }

    #[test]
    fn test_get_miss_counts() {
        let mut cache = ResponseCache::default();
        assert!(cache.get("nothing", "gemini-2.5-flash").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_expired_entry_removed_lazily() {
        let mut cache = ResponseCache::new(10, 0);
        cache.set("prompt", "gemini-2.5-flash", "4", Some(0));
        assert!(cache.get("prompt", "gemini-2.5-flash").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = ResponseCache::new(2, 3600);
        cache.set("a", "m", "1", None);
        cache.set("b", "m", "2", None);
        // Touch "a" so "b" becomes least-recently-used.
        assert!(cache.get("a", "m").is_some());
        cache.set("c", "m", "3", None);

        assert!(cache.has("a", "m"));
        assert!(!cache.has("b", "m"));
        assert!(cache.has("c", "m"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = ResponseCache::default();
        cache.set("a", "m", "1", None);
        let key = fingerprint("a", "m");
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));

        cache.set("b", "m", "2", None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_persist_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ResponseCache::default();
        cache.set("alive", "gemini-2.5-flash", "yes", None);
        cache.set("dead", "gemini-2.5-flash", "no", Some(0));
        cache.persist(&path).await.unwrap();

        let mut restored = ResponseCache::default();
        let loaded = restored.load(&path).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(restored.has("alive", "gemini-2.5-flash"));
        assert!(!restored.has("dead", "gemini-2.5-flash"));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ResponseCache::default();
        let loaded = cache.load(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_load_malformed_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let mut cache = ResponseCache::default();
        assert_eq!(cache.load(&path).await.unwrap(), 0);
        assert!(cache.is_empty());
    }
}
