//! The tiers content is resolved through.
//!
//! Every tier implements [`ContentSource`] and may hold the next tier as its fallback, forming
//! a chain from the in-memory [`MemorySource`] over the durable [`FileSource`] down to the
//! authoritative [`RemoteSource`].
//!
//! Absent content is reported as [`CacheError::NotFound`](crate::caching::CacheError::NotFound).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use latestrev_sources::{Item, ItemVersion, Manifest, ReleaseVersion};

use crate::caching::CacheEntry;

mod filesystem;
mod memory;
mod remote;

pub use filesystem::{DEFAULT_CHUNK_SIZE, FileSource};
pub use memory::MemorySource;
pub use remote::RemoteSource;

/// Provides releases and items of a single project.
#[async_trait]
pub trait ContentSource: fmt::Debug + Send + Sync {
    /// Returns the version of the latest published release.
    ///
    /// With `ignore_cache`, tiers that remember the version ask their fallback first.
    async fn get_published_release_version(&self, ignore_cache: bool) -> CacheEntry<ReleaseVersion>;

    /// Returns the manifest of a published release.
    async fn get_published_release(&self, version: ReleaseVersion) -> CacheEntry<Arc<Manifest>>;

    /// Returns the manifest of a release that is scheduled for publishing.
    async fn get_scheduled_release(&self, scheduled_id: &str) -> CacheEntry<Arc<Manifest>>;

    /// Returns the manifest of the unpublished working copy.
    async fn get_saved_release(&self) -> CacheEntry<Arc<Manifest>>;

    /// Returns a single item at the given version.
    async fn get_item(
        &self,
        collection_id: &str,
        item_id: &str,
        version: &ItemVersion,
    ) -> CacheEntry<Arc<Item>>;
}
