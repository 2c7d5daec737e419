//! Concurrent in-memory cache store.
//!
//! Workers read and publish entries through short `RwLock` sections; no lock
//! is ever held while a tool runs. Every mutation bumps a generation counter
//! so the flusher can tell whether anything changed since the last snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::entry::CacheEntry;
use super::key::PathKey;
use super::persist::{self, CacheError, CorruptPolicy};
use crate::mode::Mode;

/// Thread-safe map from [`PathKey`] to the last published entry.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<PathKey, Arc<CacheEntry>>>,
    generation: AtomicU64,
}

impl CacheStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `entries`, e.g. the result of a cache load.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (PathKey, CacheEntry)>) -> Self {
        let map = entries
            .into_iter()
            .map(|(key, entry)| (key, Arc::new(entry)))
            .collect();
        Self {
            entries: RwLock::new(map),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PathKey, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PathKey, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Look up the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &PathKey) -> Option<Arc<CacheEntry>> {
        self.read().get(key).cloned()
    }

    /// Look up the entry for `key` and return it only if it is fresh for a
    /// file whose current mtime is `modified`.
    #[must_use]
    pub fn lookup_fresh(&self, key: &PathKey, modified: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        self.get(key).filter(|entry| entry.is_fresh(modified))
    }

    /// Publish `entry` under `key`, replacing any previous value whole.
    pub fn put(&self, key: PathKey, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        self.write().insert(key, Arc::clone(&entry));
        self.bump();
        entry
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &PathKey) -> Option<Arc<CacheEntry>> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Move an entry from `from` to `to` in one step.
    ///
    /// The old key is only removed while it still holds `expected`; if a
    /// worker already replaced it, the newer value stays.
    pub fn relocate(
        &self,
        from: &PathKey,
        expected: &Arc<CacheEntry>,
        to: PathKey,
        entry: CacheEntry,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        {
            let mut map = self.write();
            if from != &to && map.get(from).is_some_and(|cur| Arc::ptr_eq(cur, expected)) {
                map.remove(from);
            }
            map.insert(to, Arc::clone(&entry));
        }
        self.bump();
        entry
    }

    /// Whether `key` has an entry, fresh or not.
    #[must_use]
    pub fn contains(&self, key: &PathKey) -> bool {
        self.read().contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Monotonic change counter.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Consistent copy of all entries, sorted by key, together with the
    /// generation it reflects.
    #[must_use]
    pub fn snapshot(&self) -> (u64, Vec<(PathKey, Arc<CacheEntry>)>) {
        let map = self.read();
        let generation = self.generation();
        let mut entries: Vec<_> = map
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();
        drop(map);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        (generation, entries)
    }

    /// Replace the contents with the cache file at `path`.
    ///
    /// A missing file leaves the store empty. Repaired entries bump the
    /// generation so the next flush persists the repair.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] when the file cannot be parsed and
    /// `policy` is [`CorruptPolicy::Abort`], or an I/O error when the file
    /// cannot be read.
    pub fn load(&self, path: &Path, mode: Mode, policy: CorruptPolicy) -> Result<usize, CacheError> {
        let loaded = persist::load_cache(path, mode, policy)?;
        let count = loaded.entries.len();
        {
            let mut map = self.write();
            map.clear();
            map.extend(
                loaded
                    .entries
                    .into_iter()
                    .map(|(key, entry)| (key, Arc::new(entry))),
            );
        }
        if loaded.repaired > 0 {
            log::warn!(
                "Repaired {} cache entries with unreadable timestamps; they will be recomputed",
                loaded.repaired
            );
            self.bump();
        }
        Ok(count)
    }
}
