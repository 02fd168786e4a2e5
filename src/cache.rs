//! Persistent response and embedding cache.
//!
//! A flat JSON object on disk mapping SHA-256 hex keys to strings. The
//! store is loaded once at the start of a run, shared between the chat
//! oracle and the embedding client, and written back at checkpoints and
//! at the end of the run.
//!
//! Embedding vectors are stored as base64 of their little-endian `f32`
//! bytes (see [`crate::embedding::vec_to_blob`]).

use anyhow::{Context, Result};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::embedding::{blob_to_vec, vec_to_blob};

/// Cache shared between oracle adapters.
pub type SharedCache = Arc<Mutex<CacheStore>>;

/// Key for a cache entry: SHA-256 over the parts, separated so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default)]
pub struct CacheStore {
    /// `None` for an in-memory store that is never written.
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl CacheStore {
    /// Load the store at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read cache: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse cache: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), entries = entries.len(), "cache loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
            dirty: false,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: String, value: String) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    pub fn get_vector(&self, key: &str) -> Option<Vec<f32>> {
        let encoded = self.get(key)?;
        let blob = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        Some(blob_to_vec(&blob))
    }

    pub fn set_vector(&mut self, key: String, vector: &[f32]) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(vec_to_blob(vector));
        self.set(key, encoded);
    }

    /// Write the store back to disk if anything changed.
    pub fn persist(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&self.entries)?)
            .with_context(|| format!("Failed to write cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace cache: {}", path.display()))?;
        debug!(path = %path.display(), entries = self.entries.len(), "cache persisted");
        self.dirty = false;
        Ok(())
    }
}

/// Open the store named by `[cache]`, or `None` when caching is off.
pub fn open_configured(config: &CacheConfig) -> Result<Option<SharedCache>> {
    if !config.enabled {
        return Ok(None);
    }
    Ok(Some(CacheStore::open(&config.path)?.shared()))
}

/// Persist a shared store.
pub fn persist_shared(cache: &SharedCache) -> Result<()> {
    cache
        .lock()
        .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?
        .persist()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keys_are_stable_and_separated() {
        assert_eq!(cache_key(&["a", "b"]), cache_key(&["a", "b"]));
        assert_ne!(cache_key(&["ab", "c"]), cache_key(&["a", "bc"]));
        assert_eq!(cache_key(&["x"]).len(), 64);
    }

    #[test]
    fn persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("cache.json");
        let mut store = CacheStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.set("k".into(), "v".into());
        store.set_vector("vec".into(), &[1.0, -0.5, 2.25]);
        store.persist().unwrap();

        let reloaded = CacheStore::open(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("k"), Some("v"));
        assert_eq!(reloaded.get_vector("vec"), Some(vec![1.0, -0.5, 2.25]));
    }

    #[test]
    fn clean_store_is_not_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        let mut store = CacheStore::open(&path).unwrap();
        store.persist().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn disabled_cache_opens_nothing() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(open_configured(&config).unwrap().is_none());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(CacheStore::open(&path).is_err());
    }
}
