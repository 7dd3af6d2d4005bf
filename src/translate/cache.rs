//! In-memory LRU result cache (source text -> translated text) and the small
//! frequency cache deciding when a multi-fragment text is cached whole.
//! Persists to a flat JSON file of `{"Key", "Value"}` pairs, most recent first.

use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Capacity of the frequency cache.
pub const FREQUENCY_CAPACITY: usize = 64;
/// A multi-fragment text seen more often than this is cached as a whole.
pub const FREQUENCY_THRESHOLD: u32 = 2;

#[derive(Debug, Error)]
pub enum CacheFileError {
    #[error("cache file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFileEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Strict LRU: lookups and inserts both refresh recency.
pub struct ResultCache {
    inner: LruCache<String, String>,
    hits: u64,
    misses: u64,
}

impl ResultCache {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        match self.inner.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn set(&mut self, key: String, value: String) {
        self.inner.put(key, value);
    }

    /// Membership test without touching recency.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.inner.len(),
        }
    }

    /// All pairs, most recently used first.
    pub fn ordered_pairs(&self) -> Vec<(String, String)> {
        self.inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Merge a cache file into this cache. File entries overwrite existing keys;
    /// if the merge overflows capacity the oldest entries are evicted.
    /// A missing file loads nothing.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, CacheFileError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache file to load");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<CacheFileEntry> = serde_json::from_str(&content)?;
        let count = entries.len();

        // The file is newest-first; insert oldest-first so recency is preserved
        // and the newest duplicate of a key is written last.
        for entry in entries.into_iter().rev() {
            self.inner.put(entry.key, entry.value);
        }

        info!(path = %path.display(), loaded = count, size = self.len(), "translation cache loaded");
        Ok(count)
    }

    /// Write up to `capacity` entries, most recently used first.
    pub fn save_file(&self, path: &Path, capacity: usize) -> Result<usize, CacheFileError> {
        let entries: Vec<CacheFileEntry> = self
            .inner
            .iter()
            .take(capacity)
            .map(|(k, v)| CacheFileEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();

        let json = serde_json::to_string_pretty(&entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), saved = entries.len(), "translation cache saved");
        Ok(entries.len())
    }
}

/// Occurrence counts for recently resolved multi-fragment texts.
pub struct FrequencyCache {
    counts: LruCache<String, u32>,
}

impl FrequencyCache {
    pub fn new() -> Self {
        Self::with_capacity(FREQUENCY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Count one more occurrence; returns the new count.
    pub fn bump(&mut self, text: &str) -> u32 {
        if let Some(count) = self.counts.get_mut(text) {
            *count += 1;
            return *count;
        }
        self.counts.put(text.to_string(), 1);
        1
    }

    pub fn count(&self, text: &str) -> u32 {
        self.counts.peek(text).copied().unwrap_or(0)
    }
}

impl Default for FrequencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(cache: &ResultCache) -> Vec<String> {
        cache.ordered_pairs().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn retains_most_recently_touched_keys() {
        let mut cache = ResultCache::new(3);
        for key in ["a", "b", "c"] {
            cache.set(key.into(), key.to_uppercase());
        }
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get("a").as_deref(), Some("A"));
        cache.set("d".into(), "D".into());
        cache.set("e".into(), "E".into());

        assert_eq!(keys(&cache), vec!["e", "d", "a"]);
        assert!(!cache.contains_key("b"));
        assert!(!cache.contains_key("c"));
    }

    #[test]
    fn update_refreshes_recency() {
        let mut cache = ResultCache::new(2);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        cache.set("a".into(), "3".into());
        cache.set("c".into(), "4".into());
        assert_eq!(keys(&cache), vec!["c", "a"]);
        assert_eq!(cache.get("a").as_deref(), Some("3"));
    }

    #[test]
    fn contains_key_does_not_touch() {
        let mut cache = ResultCache::new(2);
        cache.set("a".into(), "1".into());
        cache.set("b".into(), "2".into());
        assert!(cache.contains_key("a"));
        cache.set("c".into(), "3".into());
        assert!(!cache.contains_key("a"));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let mut cache = ResultCache::new(4);
        cache.set("a".into(), "1".into());
        cache.get("a");
        cache.get("zz");
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn save_then_load_reproduces_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ResultCache::new(10);
        cache.set("你好".into(), "Hello".into());
        cache.set("再见".into(), "Goodbye".into());
        assert_eq!(cache.save_file(&path, 10).unwrap(), 2);

        let mut restored = ResultCache::new(10);
        assert_eq!(restored.load_file(&path).unwrap(), 2);
        let mut pairs = restored.ordered_pairs();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("你好".to_string(), "Hello".to_string()),
                ("再见".to_string(), "Goodbye".to_string())
            ]
        );
        // Recency survives the round trip.
        assert_eq!(keys(&restored), vec!["再见", "你好"]);
    }

    #[test]
    fn save_writes_newest_first_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ResultCache::new(10);
        for key in ["a", "b", "c"] {
            cache.set(key.into(), key.into());
        }
        assert_eq!(cache.save_file(&path, 2).unwrap(), 2);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["Key"], "c");
        assert_eq!(raw[1]["Key"], "b");
        assert_eq!(raw.as_array().unwrap().len(), 2);
    }

    #[test]
    fn load_merges_and_keeps_newest_within_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"[{"Key":"x","Value":"new x"},{"Key":"y","Value":"y"},{"Key":"x","Value":"old x"},{"Key":"z","Value":"z"}]"#,
        )
        .unwrap();

        let mut cache = ResultCache::new(2);
        cache.set("x".into(), "memory x".into());
        cache.load_file(&path).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("x").as_deref(), Some("new x"));
        assert!(cache.contains_key("y"));
        assert!(!cache.contains_key("z"));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ResultCache::new(2);
        assert_eq!(cache.load_file(&dir.path().join("absent.json")).unwrap(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn frequency_counts_accumulate() {
        let mut freq = FrequencyCache::new();
        assert_eq!(freq.bump("menu"), 1);
        assert_eq!(freq.bump("menu"), 2);
        assert_eq!(freq.bump("menu"), 3);
        assert_eq!(freq.count("menu"), 3);
        assert_eq!(freq.count("other"), 0);
    }

    #[test]
    fn frequency_cache_is_bounded() {
        let mut freq = FrequencyCache::with_capacity(2);
        freq.bump("a");
        freq.bump("b");
        freq.bump("c");
        assert_eq!(freq.count("a"), 0);
        assert_eq!(freq.count("c"), 1);
    }
}
