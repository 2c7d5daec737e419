//! Directory walk that turns a library root into work items.
//!
//! Uses [`jwalk`] for parallel directory reading with children sorted by
//! name, so ids are stable between runs over an unchanged tree.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jwalk::WalkDir;

use super::{Library, LibraryError, LibraryIssue, WorkItem};

/// Audio extensions picked up by [`walk_library`] (lower-case, no dot).
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "m4a", "aac", "ogg", "opus", "wav", "aiff", "aif", "wma", "ape", "wv",
];

/// Walk `root` and collect every audio file as a [`WorkItem`].
///
/// Unreadable directory entries become [`LibraryIssue`]s. Hidden files and
/// directories are skipped.
///
/// # Errors
///
/// Returns [`LibraryError::NotFound`] if `root` does not exist, and
/// [`LibraryError::Interrupted`] if the shutdown flag is raised mid-walk.
pub fn walk_library(
    root: &Path,
    extensions: &[&str],
    shutdown_flag: Option<Arc<AtomicBool>>,
) -> Result<Library, LibraryError> {
    if !root.exists() {
        return Err(LibraryError::NotFound(root.to_path_buf()));
    }

    let walk_dir = WalkDir::new(root)
        .skip_hidden(true)
        .process_read_dir(|_depth, _path, _read_dir_state, children| {
            children.sort_by(|a, b| match (a, b) {
                (Ok(a), Ok(b)) => a.file_name().cmp(b.file_name()),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => std::cmp::Ordering::Equal,
            });
        });

    let mut library = Library::default();
    for entry in walk_dir {
        if shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
        {
            log::debug!("Library walk: shutdown requested");
            return Err(LibraryError::Interrupted);
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                library.issues.push(LibraryIssue {
                    record: None,
                    message: format!("walk error: {}", e),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .is_some_and(|e| extensions.contains(&e.as_str()));
        if !is_audio {
            log::trace!("Skipping non-audio file: {}", path.display());
            continue;
        }

        let id = library.items.len() as u64 + 1;
        library.items.push(WorkItem::new(id, path));
    }

    log::info!(
        "Found {} audio files under {}",
        library.items.len(),
        root.display()
    );
    Ok(library)
}
