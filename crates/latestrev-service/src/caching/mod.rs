//! # Caching infrastructure
//!
//! Content is resolved through a chain of tiers, each one caching what the tier below it
//! returned:
//!
//! - The volatile in-memory tier, backed by a [`SingleFlightCache`]. It deduplicates concurrent
//!   requests for the same key so that only one of them hits the lower tiers.
//! - The durable file-system tier, which persists manifests and items in the configured
//!   `cache_dir` and keeps serving them while the content API is unreachable.
//! - The content API itself, which is authoritative.
//!
//! Releases and items are addressed by version and never change, so they are cached without
//! expiry. Only the pointer to the currently published release expires, see
//! [`ReleaseCoordinator`](crate::coordinator::ReleaseCoordinator).
//!
//! ### Metrics
//!
//! All cache metrics are tagged with a `cache` field naming the cache:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer, including stale values.
//! - `caches.computation`: Computations actually being run.
//! - `caches.lazy_refresh`: Background refreshes of stale values.
//! - `caches.file.hit`, `caches.file.miss`: Lookups in the file-system layer.
//! - `caches.file.malformed`: Unreadable files in the file-system layer, treated as misses.
//! - `caches.file.write`: Files being written to disk.

mod cache_error;
mod cache_key;
mod fs;
mod memory;

pub use cache_error::{CacheEntry, CacheEntryExt, CacheError};
pub use cache_key::CacheKey;
pub use fs::{AtomicFileWriter, CacheWriter, read_cache_file};
pub use memory::{SingleFlightCache, StaleMode};
