//! Cache file persistence.
//!
//! One JSON document per mode:
//!
//! ```json
//! {
//!   "version": 1,
//!   "generatedAt": "2024-05-01T12:00:00Z",
//!   "trackCount": 1,
//!   "tracks": {
//!     "/music/a.flac": {
//!       "fingerprint": "AQAA...",
//!       "duration": 241.3,
//!       "lastModified": "2024-04-30T08:15:02Z",
//!       "contentHash": "9f86d0..."
//!     }
//!   }
//! }
//! ```
//!
//! Writes go to `<file>.tmp`, are synced, and then renamed over the live
//! file, so a crash mid-write leaves the previous snapshot intact. A file
//! that fails to parse is copied aside to `<file>.corrupt-<timestamp>`
//! before the run either starts empty or aborts.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::entry::{self, CacheEntry};
use super::key::PathKey;
use super::store::CacheStore;
use crate::fsutil::{remove_file_with_retry, retry_io};
use crate::mode::Mode;

/// Current cache file format version.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const LAST_MODIFIED: &str = "lastModified";
const CONTENT_HASH: &str = "contentHash";
const ARTIST: &str = "artist";
const TITLE: &str = "title";
const NEEDS_REFRESH: &str = "needsRefresh";

/// Errors from loading or writing a cache file.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Reading or writing the file failed
    #[error("cache I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The file could not be parsed and the mode does not tolerate that
    #[error("cache file {path} is corrupt ({reason}); a copy was saved to {backup}")]
    Corrupt {
        /// The corrupt file
        path: PathBuf,
        /// Where the copy was written
        backup: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The file was written by a newer version
    #[error("cache file {path} has format version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        /// The file
        path: PathBuf,
        /// Version found in the file
        found: u32,
        /// Version this build writes
        supported: u32,
    },

    /// Serializing the snapshot failed
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What to do with a cache file that cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptPolicy {
    /// Quarantine it and continue with an empty cache
    StartEmpty,
    /// Quarantine it and fail the load
    Abort,
}

impl CorruptPolicy {
    /// The policy a mode uses unless configuration overrides it.
    #[must_use]
    pub fn for_mode(mode: Mode, abort_override: Option<bool>) -> Self {
        if abort_override.unwrap_or_else(|| mode.fatal_on_corrupt_cache()) {
            Self::Abort
        } else {
            Self::StartEmpty
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generated_at: Option<String>,
    #[serde(default)]
    track_count: usize,
    tracks: BTreeMap<String, Map<String, Value>>,
}

fn default_version() -> u32 {
    CACHE_FORMAT_VERSION
}

/// Entries read from a cache file.
#[derive(Debug, Default)]
pub struct LoadedCache {
    /// Decoded entries by key
    pub entries: HashMap<PathKey, CacheEntry>,
    /// Entries whose timestamp was repaired
    pub repaired: usize,
    /// Records dropped because their payload did not decode
    pub dropped: usize,
    /// Where a corrupt file was copied, if it was
    pub quarantined: Option<PathBuf>,
}

/// Serialize one entry as a flat track record.
fn encode_entry(entry: &CacheEntry) -> serde_json::Result<Map<String, Value>> {
    let mut record = entry.payload.to_fields()?;
    record.insert(
        LAST_MODIFIED.to_string(),
        Value::String(entry.last_modified.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if let Some(hash) = &entry.content_hash {
        record.insert(CONTENT_HASH.to_string(), Value::String(hash.clone()));
    }
    if let Some(artist) = &entry.artist {
        record.insert(ARTIST.to_string(), Value::String(artist.clone()));
    }
    if let Some(title) = &entry.title {
        record.insert(TITLE.to_string(), Value::String(title.clone()));
    }
    if entry.needs_refresh {
        record.insert(NEEDS_REFRESH.to_string(), Value::Bool(true));
    }
    Ok(record)
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DDTHH:MM:SS[.fff]`, read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn take_string(record: &mut Map<String, Value>, field: &str) -> Option<String> {
    match record.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Decode one track record; the flag reports whether its timestamp was
/// repaired.
fn decode_entry(
    key: &str,
    mut record: Map<String, Value>,
    mode: Mode,
) -> Result<(CacheEntry, bool), serde_json::Error> {
    let stamp = take_string(&mut record, LAST_MODIFIED);
    let content_hash = take_string(&mut record, CONTENT_HASH);
    let artist = take_string(&mut record, ARTIST);
    let title = take_string(&mut record, TITLE);
    let flagged = matches!(record.remove(NEEDS_REFRESH), Some(Value::Bool(true)));

    let payload = mode.decode_payload(record)?;

    let (last_modified, repaired) = match stamp.as_deref().and_then(parse_timestamp) {
        Some(ts) => (ts, false),
        None => {
            let current = locate_key(key)
                .and_then(|path| entry::file_modified(&path).ok())
                .unwrap_or_else(entry::epoch);
            (current, true)
        }
    };

    let mut entry = CacheEntry::new(payload, last_modified).with_content_hash(content_hash);
    entry.artist = artist;
    entry.title = title;
    entry.needs_refresh = flagged || repaired;
    Ok((entry, repaired))
}

/// Find the file a stored key names.
///
/// Keys are case-folded, so on a case-sensitive filesystem each component
/// that does not exist verbatim is matched against its directory listing.
fn locate_key(key: &str) -> Option<PathBuf> {
    let direct = Path::new(key);
    if direct.exists() {
        return Some(direct.to_path_buf());
    }

    let mut current = if key.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(".")
    };
    for component in key.split('/').filter(|c| !c.is_empty()) {
        let verbatim = current.join(component);
        if verbatim.exists() {
            current = verbatim;
            continue;
        }
        let wanted = PathKey::from_str_path(component);
        let found = fs::read_dir(&current)
            .ok()?
            .flatten()
            .find(|dirent| PathKey::from_str_path(&dirent.file_name().to_string_lossy()) == wanted)?;
        current = found.path();
    }
    Some(current)
}

/// Path of the quarantine copy for `path` taken now.
fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache.json".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}

fn quarantine(path: &Path) -> Result<PathBuf, CacheError> {
    let backup = quarantine_path(path);
    retry_io("quarantine cache file", || fs::copy(path, &backup))
        .map_err(|e| CacheError::io(&backup, e))?;
    Ok(backup)
}

/// Read the cache file at `path` for `mode`.
///
/// A missing file yields an empty result. Individual records whose payload
/// does not decode are dropped with a warning; a document that does not
/// parse at all is quarantined and handled according to `policy`.
///
/// # Errors
///
/// See [`CacheStore::load`].
pub fn load_cache(path: &Path, mode: Mode, policy: CorruptPolicy) -> Result<LoadedCache, CacheError> {
    let raw = match retry_io("read cache file", || fs::read(path)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("No cache file at {}, starting empty", path.display());
            return Ok(LoadedCache::default());
        }
        Err(e) => return Err(CacheError::io(path, e)),
    };

    let document: CacheDocument = match serde_json::from_slice(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            let backup = quarantine(path)?;
            return match policy {
                CorruptPolicy::Abort => Err(CacheError::Corrupt {
                    path: path.to_path_buf(),
                    backup,
                    reason: e.to_string(),
                }),
                CorruptPolicy::StartEmpty => {
                    log::warn!(
                        "Cache file {} is corrupt ({}); saved a copy to {} and starting empty",
                        path.display(),
                        e,
                        backup.display()
                    );
                    Ok(LoadedCache {
                        quarantined: Some(backup),
                        ..LoadedCache::default()
                    })
                }
            };
        }
    };

    if document.version > CACHE_FORMAT_VERSION {
        return Err(CacheError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: document.version,
            supported: CACHE_FORMAT_VERSION,
        });
    }

    let mut loaded = LoadedCache::default();
    for (key, record) in document.tracks {
        match decode_entry(&key, record, mode) {
            Ok((entry, repaired)) => {
                if repaired {
                    log::debug!("Repaired timestamp for {}", key);
                    loaded.repaired += 1;
                }
                loaded.entries.insert(PathKey::from_stored(&key), entry);
            }
            Err(e) => {
                log::warn!("Dropping unreadable cache record {}: {}", key, e);
                loaded.dropped += 1;
            }
        }
    }

    log::info!(
        "Loaded {} cache entries from {}",
        loaded.entries.len(),
        path.display()
    );
    Ok(loaded)
}

/// Render a snapshot as the JSON document.
pub fn render_snapshot(
    entries: &[(PathKey, std::sync::Arc<CacheEntry>)],
) -> Result<Vec<u8>, CacheError> {
    let mut tracks = BTreeMap::new();
    for (key, entry) in entries {
        tracks.insert(key.as_str().to_string(), encode_entry(entry)?);
    }
    let document = CacheDocument {
        version: CACHE_FORMAT_VERSION,
        generated_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        track_count: tracks.len(),
        tracks,
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Path of the temporary file used while replacing `path`.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` atomically: write and sync a sibling temp
/// file, then rename it over the target.
///
/// # Errors
///
/// Returns the I/O error after retries are exhausted. On failure the
/// previous file is untouched and the temp file is removed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);

    let result = retry_io("write cache temp file", || {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })
    .and_then(|()| retry_io("replace cache file", || fs::rename(&tmp, path)));

    if result.is_err() {
        if let Err(e) = remove_file_with_retry(&tmp) {
            log::debug!("Could not remove {}: {}", tmp.display(), e);
        }
    }
    result
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A snapshot with this many entries was written
    Written(usize),
    /// Nothing changed since the last write
    Unchanged,
    /// Another flush was in flight
    Busy,
}

/// Serializes snapshot writes for one cache file.
#[derive(Debug)]
pub struct Flusher {
    path: PathBuf,
    guard: Mutex<()>,
    flushed_generation: AtomicU64,
}

impl Flusher {
    /// Create a flusher for `path`. The current store generation is treated
    /// as already on disk.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, store: &CacheStore) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
            flushed_generation: AtomicU64::new(store.generation()),
        }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Periodic flush: skipped if another flush holds the lock.
    ///
    /// # Errors
    ///
    /// Returns the write error; the previous file stays intact.
    pub fn try_flush(&self, store: &CacheStore) -> Result<FlushOutcome, CacheError> {
        let _guard = match self.guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(FlushOutcome::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.write_snapshot(store)
    }

    /// Final flush: waits for any in-flight flush, then writes.
    ///
    /// # Errors
    ///
    /// Returns the write error; the previous file stays intact.
    pub fn flush(&self, store: &CacheStore) -> Result<FlushOutcome, CacheError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_snapshot(store)
    }

    fn write_snapshot(&self, store: &CacheStore) -> Result<FlushOutcome, CacheError> {
        let (generation, entries) = store.snapshot();
        if generation == self.flushed_generation.load(Ordering::Acquire) {
            return Ok(FlushOutcome::Unchanged);
        }
        let bytes = render_snapshot(&entries)?;
        write_atomic(&self.path, &bytes).map_err(|e| CacheError::io(&self.path, e))?;
        self.flushed_generation.store(generation, Ordering::Release);
        log::debug!(
            "Flushed {} cache entries to {}",
            entries.len(),
            self.path.display()
        );
        Ok(FlushOutcome::Written(entries.len()))
    }
}
