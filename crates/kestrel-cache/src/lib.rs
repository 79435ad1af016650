//! Completion cache for Kestrel.
//!
//! [`CacheService`] maps [`CacheKey`]s to [`CacheEntry`]s behind a single lock, shadows
//! package-level results to per-interpreter JSON files through [`DiskShadow`], and bounds
//! the high-cardinality scoped keys with a background [`Reaper`].
//!
//! Freshness is the caller's job: compare an entry's `dependency_mtimes` with the live
//! files (see [`CacheEntry::is_fresh`]) before trusting it.
//!
//! [`CacheKey`]: kestrel_core::CacheKey

mod disk;
mod entry;
mod error;
mod service;
mod util;

pub use disk::{versioned_cache_dir, DiskShadow, DISK_FORMAT_VERSION};
pub use entry::{dependency_mtimes, CacheEntry, EntryState};
pub use error::{CacheError, Result};
pub use service::{CacheService, PutOutcome, Reaper};
pub use util::{atomic_write, create_private_dir};
