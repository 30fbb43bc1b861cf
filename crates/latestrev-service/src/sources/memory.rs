use std::sync::Arc;

use async_trait::async_trait;

use latestrev_sources::{Item, ItemVersion, Manifest, ReleaseVersion};

use crate::caching::{CacheEntry, CacheKey, SingleFlightCache, StaleMode};

use super::ContentSource;

/// The volatile tier, keeping published releases and items in process memory.
///
/// Entries never expire since they are addressed by version. Values are handed out as shared,
/// immutable `Arc`s. Current-state lookups (the published version, scheduled and saved
/// releases) are passed through to the fallback uncached.
#[derive(Debug)]
pub struct MemorySource {
    fallback: Arc<dyn ContentSource>,
    releases: SingleFlightCache<Arc<Manifest>>,
    items: SingleFlightCache<Arc<Item>>,
}

impl MemorySource {
    pub fn new(fallback: Arc<dyn ContentSource>) -> Self {
        Self {
            fallback,
            releases: SingleFlightCache::new("releases", None),
            items: SingleFlightCache::new("items", None),
        }
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn get_published_release_version(&self, ignore_cache: bool) -> CacheEntry<ReleaseVersion> {
        self.fallback.get_published_release_version(ignore_cache).await
    }

    async fn get_published_release(&self, version: ReleaseVersion) -> CacheEntry<Arc<Manifest>> {
        let key = CacheKey::Release(version).to_string();
        let fallback = Arc::clone(&self.fallback);
        self.releases
            .resolve(
                &key,
                move || async move { fallback.get_published_release(version).await },
                None,
                StaleMode::Blocking,
            )
            .await
    }

    async fn get_scheduled_release(&self, scheduled_id: &str) -> CacheEntry<Arc<Manifest>> {
        self.fallback.get_scheduled_release(scheduled_id).await
    }

    async fn get_saved_release(&self) -> CacheEntry<Arc<Manifest>> {
        self.fallback.get_saved_release().await
    }

    async fn get_item(
        &self,
        collection_id: &str,
        item_id: &str,
        version: &ItemVersion,
    ) -> CacheEntry<Arc<Item>> {
        let key = CacheKey::item(collection_id, item_id, version).to_string();
        let fallback = Arc::clone(&self.fallback);
        let (collection_id, item_id, version) =
            (collection_id.to_owned(), item_id.to_owned(), version.clone());
        self.items
            .resolve(
                &key,
                move || async move { fallback.get_item(&collection_id, &item_id, &version).await },
                None,
                StaleMode::Blocking,
            )
            .await
    }
}
