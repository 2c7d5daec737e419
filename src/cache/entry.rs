//! Cache entry and payload definitions.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::library::WorkItem;

/// Mood/energy features produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodFeatures {
    /// Tempo in beats per minute
    pub bpm: f64,
    /// Integrated loudness
    pub loudness: f64,
    /// Spectral centroid (Hz)
    pub spectral_centroid: f64,
    /// Spectral flux
    pub spectral_flux: f64,
    /// Estimated key, e.g. `"A"` or `"F#"`
    pub key: String,
    /// `"major"` or `"minor"`
    pub mode: String,
    /// Positivity, clamped to `[0, 1]`
    pub valence: f64,
    /// Energy, clamped to `[0, 1]`
    pub arousal: f64,
}

/// Acoustic fingerprint produced by `fpcalc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Compressed chromaprint fingerprint
    pub fingerprint: String,
    /// Duration in seconds as reported by the fingerprinter
    pub duration: f64,
}

/// Stream and container properties produced by `ffprobe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProperties {
    /// Audio codec name
    pub codec: String,
    /// Container format name
    pub container: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u32,
    /// Bit rate in bits/s, when known
    pub bit_rate: Option<u64>,
    /// Bits per sample, when the codec has one
    pub bits_per_sample: Option<u32>,
    /// Duration in seconds
    pub duration: f64,
}

/// The mode-specific result stored in an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Analyzer output
    Moods(MoodFeatures),
    /// Fingerprinter output
    Fingerprint(Fingerprint),
    /// Prober output
    Properties(MediaProperties),
}

impl Payload {
    /// Serialize the payload fields as a JSON object.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        let value = match self {
            Payload::Moods(p) => serde_json::to_value(p)?,
            Payload::Fingerprint(p) => serde_json::to_value(p)?,
            Payload::Properties(p) => serde_json::to_value(p)?,
        };
        match value {
            serde_json::Value::Object(map) => Ok(map),
            // Every payload struct serializes to an object
            _ => Ok(serde_json::Map::new()),
        }
    }
}

/// Last known result for one path.
///
/// Entries are published as `Arc<CacheEntry>` and never mutated afterwards;
/// an update is always a whole new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Mode-specific result
    pub payload: Payload,
    /// File mtime when the payload was computed
    pub last_modified: DateTime<Utc>,
    /// BLAKE3 hex digest of the file content, when known
    pub content_hash: Option<String>,
    /// Advisory artist copied from the work item
    pub artist: Option<String>,
    /// Advisory title copied from the work item
    pub title: Option<String>,
    /// Set when the stored timestamp had to be repaired on load. Such an
    /// entry is never served as a hit until it is recomputed.
    pub needs_refresh: bool,
}

impl CacheEntry {
    /// Create an entry computed against a file with the given mtime.
    #[must_use]
    pub fn new(payload: Payload, last_modified: DateTime<Utc>) -> Self {
        Self {
            payload,
            last_modified,
            content_hash: None,
            artist: None,
            title: None,
            needs_refresh: false,
        }
    }

    /// Attach the content hash.
    #[must_use]
    pub fn with_content_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    /// Copy advisory display fields from a work item.
    #[must_use]
    pub fn with_display(mut self, item: &WorkItem) -> Self {
        self.artist = Some(item.artist.clone()).filter(|s| !s.is_empty());
        self.title = Some(item.title.clone()).filter(|s| !s.is_empty());
        self
    }

    /// Whether this entry may be reused for a file whose mtime is `current`.
    ///
    /// Timestamps are compared at whole-second granularity because older
    /// cache files were written without sub-second precision.
    #[must_use]
    pub fn is_fresh(&self, current: DateTime<Utc>) -> bool {
        !self.needs_refresh && same_second(self.last_modified, current)
    }

    /// A copy of this entry re-stamped for a file with mtime `modified`,
    /// used when an entry moves to a new path.
    #[must_use]
    pub fn restamped(&self, modified: DateTime<Utc>, item: &WorkItem) -> Self {
        let mut entry = self.clone();
        entry.last_modified = modified;
        entry.needs_refresh = false;
        if !item.artist.is_empty() {
            entry.artist = Some(item.artist.clone());
        }
        if !item.title.is_empty() {
            entry.title = Some(item.title.clone());
        }
        entry
    }
}

/// Compare two timestamps truncated to whole seconds.
#[must_use]
pub fn same_second(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}

/// Read a file's mtime as UTC.
pub fn file_modified(path: &Path) -> io::Result<DateTime<Utc>> {
    let modified: SystemTime = std::fs::metadata(path)?.modified()?;
    Ok(modified.into())
}

/// The Unix epoch, used to stamp entries whose file cannot be read.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}
