//! Normalized cache keys for file paths.
//!
//! The same track can be reached through paths that differ only in
//! representation, and cache files are carried between machines:
//!
//! - macOS stores names in NFD, Windows and Linux usually in NFC
//! - Windows paths use `\`, everything else `/`
//! - Windows and macOS filesystems are case-insensitive
//!
//! A [`PathKey`] folds all three so that every spelling of a path collides:
//! the string is NFC-normalized, `\` becomes `/`, and the result is
//! lower-cased.
//!
//! # Example
//!
//! ```
//! use tunecache::cache::PathKey;
//!
//! let a = PathKey::from_str_path("C:\\Music\\Café.flac");
//! let b = PathKey::from_str_path("c:/music/cafe\u{0301}.FLAC");
//! assert_eq!(a, b);
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Case-insensitive, separator-normalized, NFC path key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    /// Build a key from a filesystem path (lossy for non-UTF-8 paths).
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self::from_str_path(&path.to_string_lossy())
    }

    /// Build a key from a path string.
    #[must_use]
    pub fn from_str_path(path: &str) -> Self {
        let nfc = normalize_nfc(path);
        Self(nfc.replace('\\', "/").to_lowercase())
    }

    /// Rebuild a key from a string that was already normalized, such as a
    /// key read back from a cache file. Normalization is re-applied so keys
    /// written by older versions still collide.
    #[must_use]
    pub fn from_stored(key: &str) -> Self {
        Self::from_str_path(key)
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for PathKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// Normalize to NFC, borrowing when the input already is.
#[must_use]
pub fn normalize_nfc(s: &str) -> Cow<'_, str> {
    if unicode_normalization::is_nfc(s) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.nfc().collect())
    }
}
