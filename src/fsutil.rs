//! Small filesystem helpers shared by the persistence, ledger and sanitizer code.
//!
//! Media libraries live on disks that other processes touch constantly:
//! antivirus scanners, indexers, the analysis tools themselves. Most of the
//! failures we see there are transient sharing violations, so every write
//! path goes through [`retry_io`] with a bounded backoff.

use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Number of attempts made by [`retry_io`] before giving up.
pub const RETRY_ATTEMPTS: u32 = 5;

/// Initial delay between attempts; doubled after every failure.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run `op` until it succeeds, retrying transient I/O failures.
///
/// `NotFound` and `InvalidInput` are never retried since waiting will not
/// fix them. The last error is returned once all attempts are used.
///
/// # Arguments
///
/// * `what` - Short description used in log messages
/// * `op` - The operation to attempt
pub fn retry_io<T, F>(what: &str, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= RETRY_ATTEMPTS || !is_transient(&e) => return Err(e),
            Err(e) => {
                log::debug!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    RETRY_ATTEMPTS,
                    e,
                    delay
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
    )
}

/// Remove a file with retries, treating an already-missing file as success.
pub fn remove_file_with_retry(path: &Path) -> io::Result<()> {
    match retry_io("remove file", || std::fs::remove_file(path)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Write all of `bytes`, retrying transient failures from the first byte
/// not yet written, so a retry never repeats data.
pub fn write_all_with_retry<W: Write>(what: &str, writer: &mut W, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let written = retry_io(what, || writer.write(bytes))?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        bytes = &bytes[written..];
    }
    Ok(())
}
