//! CSV library manifest reader.
//!
//! Expected header (column order does not matter, unknown columns are ignored):
//!
//! ```text
//! id,artist,title,album,genre,path,duration
//! ```
//!
//! `duration` is in seconds and may be fractional or empty. Rows without a
//! path are skipped and reported; a malformed duration is reported and the
//! row is kept without one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::{Library, LibraryError, LibraryIssue, WorkItem};

#[derive(Debug, Deserialize)]
struct ManifestRow {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    genre: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

/// Load a manifest file into a [`Library`].
///
/// # Errors
///
/// Returns [`LibraryError::NotFound`] if the file is missing and
/// [`LibraryError::Csv`] if the header itself cannot be read. Problems in
/// individual rows become [`LibraryIssue`]s instead.
pub fn load_manifest(path: &Path) -> Result<Library, LibraryError> {
    if !path.exists() {
        return Err(LibraryError::NotFound(path.to_path_buf()));
    }
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| LibraryError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
    read_manifest(reader, path)
}

/// Parse a manifest from any reader; used by [`load_manifest`] and tests.
pub fn read_manifest<R: std::io::Read>(
    mut reader: csv::Reader<R>,
    origin: &Path,
) -> Result<Library, LibraryError> {
    reader.headers().map_err(|source| LibraryError::Csv {
        path: origin.to_path_buf(),
        source,
    })?;

    let mut library = Library::default();
    let mut next_id: u64 = 1;

    for (idx, row) in reader.deserialize::<ManifestRow>().enumerate() {
        let record = idx as u64 + 1;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                library.issues.push(LibraryIssue {
                    record: Some(record),
                    message: format!("unreadable row: {}", e),
                });
                continue;
            }
        };

        let Some(file_path) = row.path.filter(|p| !p.is_empty()) else {
            library.issues.push(LibraryIssue {
                record: Some(record),
                message: "row has no path, skipped".to_string(),
            });
            continue;
        };

        let id = match row.id.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    library.issues.push(LibraryIssue {
                        record: Some(record),
                        message: format!("invalid id '{}', assigned {}", raw, next_id),
                    });
                    next_id
                }
            },
            None => next_id,
        };
        next_id = next_id.max(id) + 1;

        let duration = match row.duration.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => match parse_duration_secs(raw) {
                Some(d) => Some(d),
                None => {
                    library.issues.push(LibraryIssue {
                        record: Some(record),
                        message: format!("invalid duration '{}', ignored", raw),
                    });
                    None
                }
            },
            None => None,
        };

        library.items.push(WorkItem {
            id,
            artist: row.artist.unwrap_or_default(),
            title: row.title.unwrap_or_default(),
            album: row.album.unwrap_or_default(),
            genre: row.genre.unwrap_or_default(),
            path: PathBuf::from(file_path),
            duration,
        });
    }

    log::debug!(
        "Manifest {}: {} items, {} issues",
        origin.display(),
        library.items.len(),
        library.issues.len()
    );
    Ok(library)
}

fn parse_duration_secs(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
