//! Append-only ledger of failed items.
//!
//! Every failure (except a user cancellation) is written to a CSV file the
//! moment it happens, and the item is skipped on later runs until the ledger
//! is cleared. This keeps a library with a few hundred broken files from
//! paying for their timeouts again on every run.
//!
//! ```text
//! reason,artist,title,album,genre,path,duration_secs,elapsed_secs,cpu_secs
//! "stalled after 61.2s (0.4s CPU): ...",Artist,Title,Album,Rock,/music/a.flac,241.0,61.2,0.4
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::PathKey;
use crate::fsutil::{retry_io, write_all_with_retry};
use crate::library::WorkItem;
use crate::tool::ToolFailure;

/// Column names, in file order.
pub const LEDGER_HEADER: [&str; 9] = [
    "reason",
    "artist",
    "title",
    "album",
    "genre",
    "path",
    "duration_secs",
    "elapsed_secs",
    "cpu_secs",
];

/// Errors reading or writing the ledger file.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// File I/O failed
    #[error("error ledger I/O error on {path}: {source}")]
    Io {
        /// Ledger file
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The file is not readable CSV
    #[error("error ledger {path} is unreadable: {source}")]
    Csv {
        /// Ledger file
        path: PathBuf,
        /// Underlying error
        source: csv::Error,
    },
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Why the item failed
    pub reason: String,
    /// Track artist
    #[serde(default)]
    pub artist: String,
    /// Track title
    #[serde(default)]
    pub title: String,
    /// Album
    #[serde(default)]
    pub album: String,
    /// Genre
    #[serde(default)]
    pub genre: String,
    /// File path as given by the library
    pub path: String,
    /// Known track duration
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Wall time spent before the failure
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
    /// CPU time the tool used
    #[serde(default)]
    pub cpu_secs: Option<f64>,
}

/// Timing captured around a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Diagnostics {
    /// Wall time
    pub elapsed: Option<Duration>,
    /// CPU time
    pub cpu: Option<Duration>,
}

impl Diagnostics {
    /// Timing carried by the failure itself, falling back to `elapsed`.
    #[must_use]
    pub fn for_failure(failure: &ToolFailure, elapsed: Duration) -> Self {
        match failure {
            ToolFailure::Stalled { elapsed, cpu, .. } => Self {
                elapsed: Some(*elapsed),
                cpu: Some(*cpu),
            },
            _ => Self {
                elapsed: Some(elapsed),
                cpu: None,
            },
        }
    }
}

fn round_secs(d: Option<Duration>) -> Option<f64> {
    d.map(|d| (d.as_secs_f64() * 10.0).round() / 10.0)
}

impl ErrorRecord {
    /// Build the row for `item` failing with `failure`.
    #[must_use]
    pub fn new(item: &WorkItem, failure: &ToolFailure, diagnostics: Diagnostics) -> Self {
        Self {
            reason: failure.to_string(),
            artist: item.artist.clone(),
            title: item.title.clone(),
            album: item.album.clone(),
            genre: item.genre.clone(),
            path: item.path.to_string_lossy().into_owned(),
            duration_secs: round_secs(item.duration),
            elapsed_secs: round_secs(diagnostics.elapsed),
            cpu_secs: round_secs(diagnostics.cpu),
        }
    }
}

/// The error ledger for one mode.
#[derive(Debug)]
pub struct ErrorLedger {
    path: PathBuf,
    reasons: RwLock<HashMap<PathKey, String>>,
    file_lock: Mutex<()>,
}

impl ErrorLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger; it is
    /// created on the first append.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read as CSV.
    /// Individual malformed rows are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let mut reasons = HashMap::new();
        if path.exists() {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(path)
                .map_err(|source| LedgerError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
            for (index, row) in reader.deserialize::<ErrorRecord>().enumerate() {
                match row {
                    Ok(record) => {
                        reasons.insert(PathKey::from_str_path(&record.path), record.reason);
                    }
                    Err(e) => log::warn!(
                        "Skipping malformed row {} in {}: {}",
                        index + 2,
                        path.display(),
                        e
                    ),
                }
            }
            log::info!("Loaded {} failed items from {}", reasons.len(), path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            reasons: RwLock::new(reasons),
            file_lock: Mutex::new(()),
        })
    }

    /// Ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `key` failed before.
    #[must_use]
    pub fn contains(&self, key: &PathKey) -> bool {
        self.reasons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// The recorded reason for `key`.
    #[must_use]
    pub fn reason(&self, key: &PathKey) -> Option<String> {
        self.reasons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Number of distinct failed paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reasons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a failure. The row is on disk when this returns.
    ///
    /// # Errors
    ///
    /// Returns the I/O error after retries are exhausted.
    pub fn append(
        &self,
        item: &WorkItem,
        failure: &ToolFailure,
        diagnostics: Diagnostics,
    ) -> Result<(), LedgerError> {
        let record = ErrorRecord::new(item, failure, diagnostics);
        {
            let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.write_row(&record).map_err(|source| self.io_error(source))?;
        }
        self.reasons
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(PathKey::new(&item.path), record.reason);
        Ok(())
    }

    /// Open, then write the row once. Only the open and the unwritten
    /// remainder of the row are retried, so a failed write cannot leave a
    /// duplicate behind.
    fn write_row(&self, record: &ErrorRecord) -> io::Result<()> {
        let mut file = retry_io("open error ledger", || {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            OpenOptions::new().create(true).append(true).open(&self.path)
        })?;
        let needs_header = file.metadata()?.len() == 0;
        let bytes = render_row(record, needs_header)?;
        write_all_with_retry("append to error ledger", &mut file, &bytes)?;
        retry_io("sync error ledger", || file.sync_data())
    }

    /// Forget every failure and truncate the file to its header.
    ///
    /// # Errors
    ///
    /// Returns the I/O error after retries are exhausted.
    pub fn clear(&self) -> Result<(), LedgerError> {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        retry_io("clear error ledger", || {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut writer = csv::Writer::from_writer(File::create(&self.path)?);
            writer.write_record(LEDGER_HEADER)?;
            writer.flush()?;
            Ok(())
        })
        .map_err(|source| self.io_error(source))?;

        let cleared = {
            let mut reasons = self.reasons.write().unwrap_or_else(PoisonError::into_inner);
            let n = reasons.len();
            reasons.clear();
            n
        };
        log::info!("Cleared {} entries from {}", cleared, self.path.display());
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// One ledger row as CSV bytes, preceded by the header for a new file.
fn render_row(record: &ErrorRecord, with_header: bool) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(LEDGER_HEADER)?;
    }
    writer.serialize(record)?;
    writer.into_inner().map_err(|e| e.into_error())
}
