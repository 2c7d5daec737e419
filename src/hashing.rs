//! BLAKE3 content hashing for cross-machine matching.
//!
//! Files are streamed through the hasher in fixed-size chunks so memory use
//! does not depend on file size. The digest is rendered as lower-case hex,
//! which is the form stored in cache files.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read buffer size.
const CHUNK_SIZE: usize = 256 * 1024;

/// Hash the contents of `path`.
///
/// If `cancel` is raised between chunks the hash is abandoned with an
/// [`io::ErrorKind::Interrupted`] error.
///
/// # Errors
///
/// Returns any error from opening or reading the file.
pub fn hash_file(path: &Path, cancel: Option<&AtomicBool>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "hashing cancelled"));
        }
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash an in-memory buffer.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
