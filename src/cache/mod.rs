//! Result cache for tunecache.
//!
//! This module keeps the last known tool result for every processed file so
//! that later runs only pay for files that actually changed.
//!
//! # Architecture
//!
//! * [`key`]: Normalized [`PathKey`]s that make path spellings collide.
//! * [`entry`]: The entry and payload types, plus the freshness rule.
//! * [`store`]: The concurrent in-memory [`CacheStore`].
//! * [`resolver`]: The [`ContentHashIndex`] used to follow files that moved
//!   to a new path or a new machine.
//! * [`persist`]: Atomic JSON snapshots, load-time repair and corruption
//!   quarantine.
//!
//! # Cache Invalidation
//!
//! An entry is reused only when the file's mtime, truncated to whole
//! seconds, equals the stored one and the entry was not flagged for refresh
//! while loading. Anything else is recomputed.

pub mod entry;
pub mod key;
pub mod persist;
pub mod resolver;
pub mod store;

pub use entry::{CacheEntry, Fingerprint, MediaProperties, MoodFeatures, Payload};
pub use key::PathKey;
pub use persist::{CacheError, CorruptPolicy, FlushOutcome, Flusher, CACHE_FORMAT_VERSION};
pub use resolver::{Claim, ClaimKind, ContentHashIndex};
pub use store::CacheStore;
