//! Safe input paths for tools that cannot open arbitrary file names.
//!
//! Several analysis tools are built against narrow-character C runtimes and
//! fail on any path outside printable ASCII. Before a tool runs, the input
//! path is replaced by an equivalent safe one:
//!
//! 1. A path that is already printable ASCII is used as-is.
//! 2. On Windows, the 8.3 short-name alias is used if the volume has one and
//!    it keeps the file extension (tools pick decoders by extension).
//! 3. Otherwise a hard link named `tc-link-<pid>-<seq>.<ext>` is created in
//!    the first directory that accepts it, and removed after the tool ran.
//!    Hard links cannot cross filesystems, so directories on the source's
//!    own volume come first: the drive root on Windows, and on Unix a
//!    `.tunecache-links` directory in the nearest ASCII-safe ancestor and
//!    then at the mount root.
//!
//! If none of these work the original path is passed through and the tool
//! gets its chance to fail on its own.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sysinfo::{Pid, System};

use crate::fsutil::remove_file_with_retry;

/// File name prefix of sanitizer links.
pub const LINK_PREFIX: &str = "tc-link-";

/// Name of the link directory under a drive root or the temp directory.
pub const LINK_DIR_NAME: &str = "tunecache-links";

/// Name of the link directory placed on a Unix source's own filesystem.
pub const VOLUME_LINK_DIR_NAME: &str = ".tunecache-links";

/// Whether a tool can be handed `path` unchanged.
#[must_use]
pub fn is_safe(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|s| s.chars().all(|c| c == ' ' || c.is_ascii_graphic()))
}

/// Lower-cased extension of `path`, if it has a printable ASCII one.
fn safe_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
}

/// Removes a sanitizer link when dropped.
struct LinkGuard {
    path: PathBuf,
    released: bool,
}

impl LinkGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match remove_file_with_retry(&self.path) {
            Ok(()) => log::trace!("Removed link {}", self.path.display()),
            Err(e) => log::warn!("Could not remove link {}: {}", self.path.display(), e),
        }
        // Leave nothing behind inside the library; fails while other links remain
        if let Some(dir) = self.path.parent() {
            if dir.file_name().is_some_and(|n| n == VOLUME_LINK_DIR_NAME) {
                let _ = fs::remove_dir(dir);
            }
        }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps unsafe input paths to safe equivalents for the duration of a call.
#[derive(Debug)]
pub struct PathSanitizer {
    link_dir: Option<PathBuf>,
    seq: AtomicU64,
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PathSanitizer {
    /// Create a sanitizer. `link_dir` is tried after the volume's own
    /// scratch directories and before the system temp directory.
    #[must_use]
    pub fn new(link_dir: Option<PathBuf>) -> Self {
        Self {
            link_dir,
            seq: AtomicU64::new(0),
        }
    }

    /// Directories tried for hard links, in order.
    fn candidate_dirs(&self, source: &Path) -> Vec<PathBuf> {
        let mut dirs = volume_scratch_dirs(source);
        if let Some(dir) = &self.link_dir {
            dirs.push(dir.clone());
        }
        dirs.push(std::env::temp_dir().join(LINK_DIR_NAME));
        dirs
    }

    /// Run `f` with a path the tool can open.
    ///
    /// Any link created for the call is removed when `f` returns or panics.
    pub fn with_safe_path<R>(&self, path: &Path, f: impl FnOnce(&Path) -> R) -> R {
        if is_safe(path) {
            return f(path);
        }

        if let Some(short) = short_name(path) {
            log::debug!("Using short name {} for {}", short.display(), path.display());
            return f(&short);
        }

        match self.create_link(path) {
            Some(mut guard) => {
                log::debug!("Linked {} as {}", path.display(), guard.path.display());
                let result = f(&guard.path);
                guard.release();
                result
            }
            None => {
                log::warn!(
                    "No ASCII-safe alias for {}; passing the original path",
                    path.display()
                );
                f(path)
            }
        }
    }

    fn create_link(&self, source: &Path) -> Option<LinkGuard> {
        let ext = safe_extension(source).unwrap_or_else(|| "bin".to_string());
        for dir in self.candidate_dirs(source) {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let link = dir.join(format!("{}{}-{}.{}", LINK_PREFIX, std::process::id(), seq, ext));
            if !is_safe(&link) {
                log::trace!("Skipping link dir {}: not ASCII-safe", dir.display());
                continue;
            }
            // A concurrent release may remove an empty volume dir in between
            let linked = link_into(&dir, source, &link).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => link_into(&dir, source, &link),
                _ => Err(e),
            });
            match linked {
                Ok(()) => {
                    return Some(LinkGuard {
                        path: link,
                        released: false,
                    })
                }
                Err(e) => log::debug!("Cannot link into {}: {}", dir.display(), e),
            }
        }
        None
    }

    /// Remove links left behind by runs that no longer exist.
    ///
    /// Links owned by a live process (including this one) are kept. Returns
    /// the number of files removed.
    pub fn sweep_orphans(&self) -> usize {
        let mut dirs = vec![std::env::temp_dir().join(LINK_DIR_NAME)];
        if let Some(dir) = &self.link_dir {
            dirs.push(dir.clone());
        }
        dirs.extend(volume_scratch_roots());
        sweep_dirs(dirs)
    }

    /// Like [`sweep_orphans`](Self::sweep_orphans), for the volume link
    /// directories that links for `sources` would use.
    ///
    /// Only sources that need a link are looked at, and each parent
    /// directory is resolved once.
    pub fn sweep_orphans_near<'a>(&self, sources: impl IntoIterator<Item = &'a Path>) -> usize {
        let mut parents = HashSet::new();
        let mut dirs = BTreeSet::new();
        for source in sources {
            if is_safe(source) || !parents.insert(source.parent().map(Path::to_path_buf)) {
                continue;
            }
            dirs.extend(volume_scratch_dirs(source));
        }
        sweep_dirs(dirs)
    }
}

fn link_into(dir: &Path, source: &Path, link: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::hard_link(source, link)
}

fn sweep_dirs(dirs: impl IntoIterator<Item = PathBuf>) -> usize {
    let mut system = System::new();
    let mut removed = 0;
    for dir in dirs {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::debug!("Cannot read {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(owner) = name.to_str().and_then(link_owner) else {
                continue;
            };
            if system.refresh_process(Pid::from_u32(owner)) {
                continue;
            }
            match remove_file_with_retry(&entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Could not remove {}: {}", entry.path().display(), e),
            }
        }
        if dir.file_name().is_some_and(|n| n == VOLUME_LINK_DIR_NAME) {
            let _ = fs::remove_dir(&dir);
        }
    }
    if removed > 0 {
        log::info!("Removed {} orphaned links from earlier runs", removed);
    }
    removed
}

/// The pid encoded in a link file name.
#[must_use]
pub fn link_owner(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(LINK_PREFIX)?
        .split('-')
        .next()?
        .parse()
        .ok()
}

/// `<drive>:\tunecache-links` for the volume holding `source`.
#[cfg(windows)]
fn volume_scratch_dirs(source: &Path) -> Vec<PathBuf> {
    use std::path::{Component, Prefix};
    let Some(Component::Prefix(prefix)) = source.components().next() else {
        return Vec::new();
    };
    match prefix.kind() {
        Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => vec![PathBuf::from(format!(
            "{}:\\{}",
            char::from(letter),
            LINK_DIR_NAME
        ))],
        _ => Vec::new(),
    }
}

/// `.tunecache-links` in the nearest ASCII-safe ancestor of `source` and at
/// the root of its mount, both on the same device as `source`.
#[cfg(unix)]
fn volume_scratch_dirs(source: &Path) -> Vec<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let Ok(source) = std::path::absolute(source) else {
        return Vec::new();
    };
    let Ok(dev) = fs::metadata(&source).map(|m| m.dev()) else {
        return Vec::new();
    };
    let same_device: Vec<&Path> = source
        .ancestors()
        .skip(1)
        .take_while(|dir| fs::metadata(dir).is_ok_and(|m| m.dev() == dev))
        .collect();

    let mut dirs = Vec::new();
    if let Some(near) = same_device.iter().find(|dir| is_safe(dir)) {
        dirs.push(near.join(VOLUME_LINK_DIR_NAME));
    }
    if let Some(root) = same_device.last() {
        let dir = root.join(VOLUME_LINK_DIR_NAME);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

#[cfg(not(any(unix, windows)))]
fn volume_scratch_dirs(_source: &Path) -> Vec<PathBuf> {
    Vec::new()
}

#[cfg(windows)]
fn volume_scratch_roots() -> Vec<PathBuf> {
    (b'A'..=b'Z')
        .map(|letter| PathBuf::from(format!("{}:\\{}", char::from(letter), LINK_DIR_NAME)))
        .filter(|dir| dir.is_dir())
        .collect()
}

#[cfg(not(windows))]
fn volume_scratch_roots() -> Vec<PathBuf> {
    Vec::new()
}

/// The 8.3 alias of `path`, if the volume generates one and it keeps the
/// extension.
#[cfg(windows)]
fn short_name(path: &Path) -> Option<PathBuf> {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    let output = Command::new("cmd")
        .arg("/C")
        .raw_arg(format!("for %I in (\"{}\") do @echo %~sI", path.display()))
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let short = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    let same_ext = safe_extension(&short) == safe_extension(path);
    (is_safe(&short) && same_ext && short.exists()).then_some(short)
}

#[cfg(not(windows))]
fn short_name(_path: &Path) -> Option<PathBuf> {
    None
}
