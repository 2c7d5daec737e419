//! Library collaborators: where work items come from.
//!
//! The engine only needs an ordered list of [`WorkItem`]s plus a channel of
//! non-fatal issues found while reading the source. Two sources are provided:
//!
//! - [`manifest`]: a CSV manifest exported from a music library
//! - [`walk`]: a directory walk that discovers audio files by extension
//!
//! # Example
//!
//! ```no_run
//! use tunecache::library::{manifest::load_manifest, Library};
//! use std::path::Path;
//!
//! let library: Library = load_manifest(Path::new("library.csv")).unwrap();
//! for issue in &library.issues {
//!     log::warn!("{}", issue);
//! }
//! println!("{} tracks to process", library.items.len());
//! ```

pub mod manifest;
pub mod walk;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// One file to be processed in a run.
///
/// Only `path` is identity. The display fields are advisory and are copied
/// into cache entries and error rows to make them readable.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable numeric identifier from the library
    pub id: u64,
    /// Track artist
    pub artist: String,
    /// Track title
    pub title: String,
    /// Album name
    pub album: String,
    /// Genre
    pub genre: String,
    /// Path to the audio file
    pub path: PathBuf,
    /// Duration, when the library already knows it
    pub duration: Option<Duration>,
}

impl WorkItem {
    /// Create a work item with empty display metadata.
    #[must_use]
    pub fn new(id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            artist: String::new(),
            title: String::new(),
            album: String::new(),
            genre: String::new(),
            path: path.into(),
            duration: None,
        }
    }

    /// Set the known duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set artist and title.
    #[must_use]
    pub fn with_display(mut self, artist: &str, title: &str) -> Self {
        self.artist = artist.to_string();
        self.title = title.to_string();
        self
    }

    /// `Artist - Title` when known, else the file name.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.artist.is_empty() && self.title.is_empty() {
            return self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string());
        }
        format!("{} - {}", self.artist, self.title)
    }
}

/// A non-fatal problem found while reading a library source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryIssue {
    /// 1-based record number (row or discovery order), if known
    pub record: Option<u64>,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for LibraryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record {
            Some(n) => write!(f, "record {}: {}", n, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Work items plus the issues reported while producing them.
#[derive(Debug, Clone, Default)]
pub struct Library {
    /// Items in library order
    pub items: Vec<WorkItem>,
    /// Diagnostics; never fatal
    pub issues: Vec<LibraryIssue>,
}

/// Errors that prevent a library source from being read at all.
#[derive(thiserror::Error, Debug)]
pub enum LibraryError {
    /// The manifest or root directory does not exist.
    #[error("Library source not found: {0}")]
    NotFound(PathBuf),

    /// The manifest could not be parsed as CSV.
    #[error("Malformed manifest {path}: {source}")]
    Csv {
        /// Manifest path
        path: PathBuf,
        /// The underlying CSV error
        #[source]
        source: csv::Error,
    },

    /// The walk was interrupted by shutdown.
    #[error("Library walk interrupted")]
    Interrupted,
}

/// Anything that can produce the items of a run.
pub trait LibrarySource {
    /// Read the whole library.
    ///
    /// # Errors
    ///
    /// Returns an error only when the source cannot be read at all; row or
    /// entry problems are reported in [`Library::issues`].
    fn load(&self) -> Result<Library, LibraryError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// A CSV manifest file.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    /// Manifest path
    pub path: PathBuf,
}

impl LibrarySource for ManifestSource {
    fn load(&self) -> Result<Library, LibraryError> {
        manifest::load_manifest(&self.path)
    }

    fn describe(&self) -> String {
        format!("manifest {}", self.path.display())
    }
}

/// A directory tree scanned for audio files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    /// Root directory
    pub root: PathBuf,
    /// Lower-case extensions to accept
    pub extensions: Vec<String>,
    /// Raised to abandon the walk
    pub shutdown_flag: Option<Arc<AtomicBool>>,
}

impl DirectorySource {
    /// Walk `root` for the usual audio extensions.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: walk::AUDIO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            shutdown_flag: None,
        }
    }

    /// Abandon the walk when `flag` is raised.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }
}

impl LibrarySource for DirectorySource {
    fn load(&self) -> Result<Library, LibraryError> {
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        walk::walk_library(&self.root, &extensions, self.shutdown_flag.clone())
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}
