//! Cross-machine resolution by content hash.
//!
//! When a library is copied to another machine or reorganized on disk, every
//! path changes but the bytes do not. The [`ContentHashIndex`] maps content
//! hashes to the entry that holds them, so a file at a new path can reuse
//! the result computed for its old path without running the tool again.
//!
//! A hit moves the entry to the new key. When the old path is itself still
//! part of the current run, or another path already claimed the hash during
//! this run, the entry is copied instead so that two live copies of the same
//! file never evict each other.
//!
//! Resolution only ever applies across paths. A file whose own entry is
//! stale is recomputed even if its bytes are unchanged, and entries flagged
//! for refresh are never handed out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::entry::CacheEntry;
use super::key::PathKey;
use super::store::CacheStore;
use crate::library::WorkItem;

/// How a claimed entry was published under its new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// The old key was removed
    Moved,
    /// The old key was kept
    Copied,
}

/// Result of a successful [`ContentHashIndex::claim`].
#[derive(Debug, Clone)]
pub struct Claim {
    /// The entry now stored under the new key
    pub entry: Arc<CacheEntry>,
    /// Where the entry came from
    pub from: PathKey,
    /// Whether the old key survived
    pub kind: ClaimKind,
}

#[derive(Debug, Default)]
struct IndexState {
    by_hash: HashMap<String, (Arc<CacheEntry>, PathKey)>,
    claimed: HashSet<String>,
}

/// Content hash → (entry, key) index, rebuilt once per run and never
/// persisted.
#[derive(Debug, Default)]
pub struct ContentHashIndex {
    state: Mutex<IndexState>,
    live_keys: HashSet<PathKey>,
}

impl ContentHashIndex {
    /// Index every entry in `store` that carries a content hash.
    ///
    /// If several keys share a hash, the lowest key wins so the choice does
    /// not depend on hash map iteration order.
    #[must_use]
    pub fn build(store: &CacheStore) -> Self {
        let (_, entries) = store.snapshot();
        let mut by_hash = HashMap::new();
        for (key, entry) in entries {
            if entry.needs_refresh {
                continue;
            }
            if let Some(hash) = entry.content_hash.clone() {
                by_hash.entry(hash).or_insert((entry, key));
            }
        }
        log::debug!("Content hash index holds {} entries", by_hash.len());
        Self {
            state: Mutex::new(IndexState {
                by_hash,
                claimed: HashSet::new(),
            }),
            live_keys: HashSet::new(),
        }
    }

    /// Declare the keys that belong to the current run. Entries stored under
    /// these keys are copied rather than moved when claimed.
    #[must_use]
    pub fn with_live_keys(mut self, keys: impl IntoIterator<Item = PathKey>) -> Self {
        self.live_keys = keys.into_iter().collect();
        self
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of indexed hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_hash.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the entry and key currently holding `hash`.
    #[must_use]
    pub fn resolve(&self, hash: &str) -> Option<(Arc<CacheEntry>, PathKey)> {
        self.lock().by_hash.get(hash).cloned()
    }

    /// Record that `hash` is held by a path that is live in this run, e.g.
    /// after a direct cache hit or a fresh computation.
    pub fn mark_live(&self, hash: &str, key: &PathKey, entry: &Arc<CacheEntry>) {
        let mut state = self.lock();
        state.claimed.insert(hash.to_string());
        state
            .by_hash
            .insert(hash.to_string(), (Arc::clone(entry), key.clone()));
    }

    /// Reuse the entry holding `hash` for the file `item` now at `new_key`
    /// with mtime `modified`.
    ///
    /// The re-stamped entry is published in `store` under `new_key` and the
    /// index is pointed at it. Returns `None` when no entry holds `hash`,
    /// when the holder is `new_key` itself, or when the holder is flagged
    /// for refresh.
    pub fn claim(
        &self,
        hash: &str,
        new_key: &PathKey,
        item: &WorkItem,
        modified: DateTime<Utc>,
        store: &CacheStore,
    ) -> Option<Claim> {
        let mut state = self.lock();
        let (source, from) = state.by_hash.get(hash).cloned()?;
        if from == *new_key || source.needs_refresh {
            return None;
        }

        let restamped = source.restamped(modified, item);
        let keep_old = state.claimed.contains(hash) || self.live_keys.contains(&from);

        let (entry, kind) = if keep_old {
            (store.put(new_key.clone(), restamped), ClaimKind::Copied)
        } else {
            (
                store.relocate(&from, &source, new_key.clone(), restamped),
                ClaimKind::Moved,
            )
        };

        state.claimed.insert(hash.to_string());
        state
            .by_hash
            .insert(hash.to_string(), (Arc::clone(&entry), new_key.clone()));

        Some(Claim { entry, from, kind })
    }
}
