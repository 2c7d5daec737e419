//! The per-item pipeline.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Dispatcher, Outcome, RunStats};
use crate::cache::entry::file_modified;
use crate::cache::{CacheEntry, ClaimKind, ContentHashIndex, PathKey};
use crate::hashing::hash_file;
use crate::ledger::Diagnostics;
use crate::library::WorkItem;
use crate::tool::{ToolFailure, ToolOutput};

/// Everything a worker needs besides the item itself.
pub(super) struct ItemContext<'a> {
    pub(super) dispatcher: &'a Dispatcher,
    pub(super) index: &'a ContentHashIndex,
    pub(super) cancel: &'a AtomicBool,
}

/// Early exit from the pipeline: either a final outcome or a failure still
/// to be recorded.
enum Stop {
    Done(Outcome),
    Failed(ToolFailure),
}

impl From<ToolFailure> for Stop {
    fn from(failure: ToolFailure) -> Self {
        Stop::Failed(failure)
    }
}

impl ItemContext<'_> {
    /// Take one item through every phase.
    pub(super) fn process(&self, item: &WorkItem, stats: &RunStats) -> Outcome {
        if self.cancel.load(Ordering::SeqCst) {
            return Outcome::NotStarted;
        }

        let started = Instant::now();
        match self.pipeline(item, stats) {
            Ok(()) => Outcome::Success,
            Err(Stop::Done(outcome)) => outcome,
            Err(Stop::Failed(ToolFailure::Cancelled)) => {
                log::debug!("[{}] cancelled: {}", item.id, item.path.display());
                Outcome::Cancelled
            }
            Err(Stop::Failed(failure)) => self.record_failure(item, failure, started.elapsed()),
        }
    }

    fn pipeline(&self, item: &WorkItem, stats: &RunStats) -> Result<(), Stop> {
        let d = self.dispatcher;
        let key = PathKey::new(&item.path);

        if d.ledger.contains(&key) {
            log::trace!("[{}] skipped, failed earlier: {}", item.id, item.path.display());
            return Err(Stop::Done(Outcome::ErrorSkip));
        }

        // Read before the tool runs: an edit during analysis invalidates it
        let modified = file_modified(&item.path).map_err(|e| not_found(&item.path, &e))?;

        if let Some(entry) = d.store.lookup_fresh(&key, modified) {
            self.on_cache_hit(item, &key, &entry)?;
            return Err(Stop::Done(Outcome::CacheHit));
        }

        let hash = if d.config.content_hash || d.mode.requires_content_hash() {
            Some(self.hash(&item.path)?)
        } else {
            None
        };

        if let Some(hash) = &hash {
            if let Some(claim) = self.index.claim(hash, &key, item, modified, &d.store) {
                match claim.kind {
                    ClaimKind::Moved => log::info!(
                        "[{}] reused result of {} for {}",
                        item.id,
                        claim.from,
                        key
                    ),
                    ClaimKind::Copied => log::debug!(
                        "[{}] copied result of {} for {}",
                        item.id,
                        claim.from,
                        key
                    ),
                }
                return Err(Stop::Done(Outcome::CrossMachineHit));
            }
        }

        if let (Some(actual), Some(limit)) = (item.duration, d.config.max_duration) {
            if actual > limit {
                return Err(ToolFailure::DurationExceeded { actual, limit }.into());
            }
        }

        let output = match self.invoke_once(&item.path) {
            Err(ToolFailure::ChannelCountUnsupported { reason }) if d.downmixer.is_some() => {
                log::debug!("[{}] {}; retrying with a downmix", item.id, reason);
                self.invoke_downmixed(item, stats)?
            }
            other => other?,
        };
        let payload = d
            .mode
            .parse_output(&output.payload)
            .map_err(|e| ToolFailure::ParseFailure(e.to_string()))?;

        let entry = d.store.put(
            key.clone(),
            CacheEntry::new(payload, modified)
                .with_content_hash(hash.clone())
                .with_display(item),
        );
        if let Some(hash) = &hash {
            self.index.mark_live(hash, &key, &entry);
        }
        log::debug!(
            "[{}] computed {} in {:.1}s ({:.1}s CPU)",
            item.id,
            item.display_name(),
            output.elapsed.as_secs_f64(),
            output.cpu.as_secs_f64()
        );
        Ok(())
    }

    /// Keep the index aware of a directly hit entry, and give hashless
    /// entries a hash when the mode always stores one.
    fn on_cache_hit(&self, item: &WorkItem, key: &PathKey, entry: &Arc<CacheEntry>) -> Result<(), Stop> {
        let d = self.dispatcher;
        match &entry.content_hash {
            Some(hash) => self.index.mark_live(hash, key, entry),
            None if d.mode.requires_content_hash() => {
                let hash = match self.hash(&item.path) {
                    Ok(hash) => hash,
                    // The cached result is still good without a hash
                    Err(Stop::Failed(ToolFailure::NotFound(_))) => return Ok(()),
                    Err(stop) => return Err(stop),
                };
                let updated = d
                    .store
                    .put(key.clone(), (**entry).clone().with_content_hash(Some(hash.clone())));
                self.index.mark_live(&hash, key, &updated);
                log::trace!("[{}] backfilled content hash", item.id);
            }
            None => {}
        }
        Ok(())
    }

    fn hash(&self, path: &Path) -> Result<String, Stop> {
        hash_file(path, Some(self.cancel)).map_err(|e| match e.kind() {
            io::ErrorKind::Interrupted => Stop::Failed(ToolFailure::Cancelled),
            _ => Stop::Failed(not_found(path, &e)),
        })
    }

    /// Run the mode's tool once against a safe alias of `path`.
    fn invoke_once(&self, path: &Path) -> Result<ToolOutput, ToolFailure> {
        let d = self.dispatcher;
        d.sanitizer
            .with_safe_path(path, |safe| d.invoker.invoke(&d.spec, safe, self.cancel))
    }

    fn invoke_downmixed(
        &self,
        item: &WorkItem,
        stats: &RunStats,
    ) -> Result<ToolOutput, ToolFailure> {
        let d = self.dispatcher;
        let Some(downmixer) = &d.downmixer else {
            return Err(ToolFailure::ChannelCountUnsupported {
                reason: "no downmix available".to_string(),
            });
        };
        stats.add_downmixed();
        let mixed = d
            .sanitizer
            .with_safe_path(&item.path, |safe| downmixer.downmix(safe, self.cancel))?;
        // The converted file is ASCII-named scratch, so no sanitizing here
        d.invoker.invoke(&d.spec, mixed.path(), self.cancel)
    }

    fn record_failure(&self, item: &WorkItem, failure: ToolFailure, elapsed: Duration) -> Outcome {
        log::warn!(
            "[{}] {} failed: {}",
            item.id,
            item.path.display(),
            failure
        );
        let diagnostics = Diagnostics::for_failure(&failure, elapsed);
        if let Err(e) = self.dispatcher.ledger.append(item, &failure, diagnostics) {
            log::error!("[{}] could not record failure: {}", item.id, e);
        }
        Outcome::ErrorRecorded(failure)
    }
}

fn not_found(path: &Path, err: &io::Error) -> ToolFailure {
    log::debug!("Cannot read {}: {}", path.display(), err);
    ToolFailure::NotFound(path.to_path_buf())
}
