use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use latestrev_sources::{Item, ItemVersion, Manifest, ReleaseVersion};

use crate::caching::{
    AtomicFileWriter, CacheEntry, CacheEntryExt, CacheError, CacheKey, CacheWriter,
    read_cache_file,
};
use crate::utils::futures::join_chunked;

use super::ContentSource;

/// The default number of items prefetched concurrently.
pub const DEFAULT_CHUNK_SIZE: usize = 25;

/// The durable tier, persisting releases and items below a cache directory.
///
/// Misses are resolved through the fallback source and written back. Without a fallback, only
/// what was previously persisted is served, which allows running offline.
#[derive(Debug)]
pub struct FileSource {
    cache_dir: PathBuf,
    fallback: Option<Arc<dyn ContentSource>>,
    writer: Arc<dyn CacheWriter>,
    chunk_size: usize,
}

impl FileSource {
    /// Creates a file source rooted at `cache_dir`, without a fallback.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        let writer = Arc::new(AtomicFileWriter::new(&cache_dir));
        Self {
            cache_dir,
            fallback: None,
            writer,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Resolves misses through `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn ContentSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Replaces the strategy used to persist fetched content.
    pub fn with_writer(mut self, writer: Arc<dyn CacheWriter>) -> Self {
        self.writer = writer;
        self
    }

    /// Sets how many items of a release are prefetched concurrently.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Reads a persisted entry.
    ///
    /// Missing, unreadable and corrupt files are all reported as `NotFound`.
    async fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> CacheEntry<T> {
        let path = self.cache_dir.join(key.cache_path());
        tracing::trace!("Trying file cache at path {}", path.display());

        let contents = match read_cache_file(&path).await {
            Ok(Some(contents)) => contents,
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1, "cache" => "content");
                return Err(CacheError::NotFound);
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache file",
                );
                return Err(CacheError::NotFound);
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(value) => {
                metric!(counter("caches.file.hit") += 1, "cache" => "content");
                Ok(value)
            }
            Err(e) => {
                metric!(counter("caches.file.malformed") += 1, "cache" => "content");
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Ignoring unreadable cache file",
                );
                Err(CacheError::NotFound)
            }
        }
    }

    /// Persists an entry. Failures are logged and otherwise ignored.
    fn store<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let path = self.cache_dir.join(key.cache_path());

        let result = serde_json::to_vec_pretty(value)
            .map_err(std::io::Error::other)
            .and_then(|contents| self.writer.write(&path, &contents));

        metric!(
            counter("caches.file.write") += 1,
            "status" => if result.is_ok() { "ok" } else { "failed" },
        );
        if let Err(e) = result {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to write cache file",
            );
        }
    }

    fn fallback(&self) -> CacheEntry<&Arc<dyn ContentSource>> {
        self.fallback.as_ref().ok_or(CacheError::NotFound)
    }

    /// Returns the highest version among the persisted published releases.
    async fn latest_persisted_version(&self) -> CacheEntry<ReleaseVersion> {
        let published_dir = self.cache_dir.join("published");
        let mut entries = match tokio::fs::read_dir(&published_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(version) = persisted_version(&entry.path()) {
                latest = latest.max(Some(version));
            }
        }
        latest.ok_or(CacheError::NotFound)
    }

    /// Resolves every item of `manifest` through this tier, so they get persisted.
    ///
    /// Items the fallback does not know are skipped, only real failures abort.
    async fn prefetch_items(&self, manifest: &Manifest) -> CacheEntry {
        let items: Vec<_> = manifest.items().collect();
        tracing::debug!(items = items.len(), "Prefetching release items");

        let fetched = join_chunked(items, self.chunk_size, |(collection_id, item_id, version)| {
            async move { self.get_item(collection_id, item_id, version).await.found() }
        })
        .await?;

        let missing = fetched.iter().filter(|item| item.is_none()).count();
        if missing > 0 {
            tracing::debug!(missing, "Release pins items that do not exist");
        }
        Ok(())
    }
}

/// Parses the version out of a `published/<version>.json` path.
fn persisted_version(path: &Path) -> Option<ReleaseVersion> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[async_trait]
impl ContentSource for FileSource {
    async fn get_published_release_version(&self, ignore_cache: bool) -> CacheEntry<ReleaseVersion> {
        if let (true, Some(fallback)) = (ignore_cache, &self.fallback) {
            match fallback.get_published_release_version(true).await {
                Ok(version) => return Ok(version),
                Err(CacheError::NotFound) => {}
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Failed to fetch published version, using the latest persisted one",
                    );
                }
            }
        }

        self.latest_persisted_version().await
    }

    async fn get_published_release(&self, version: ReleaseVersion) -> CacheEntry<Arc<Manifest>> {
        let key = CacheKey::Release(version);
        match self.load::<Manifest>(&key).await {
            Err(CacheError::NotFound) => {}
            result => return result.map(Arc::new),
        }

        let manifest = self.fallback()?.get_published_release(version).await?;
        // the manifest is only persisted once all of its items are
        self.prefetch_items(&manifest).await?;
        self.store(&key, &manifest);

        Ok(manifest)
    }

    async fn get_scheduled_release(&self, scheduled_id: &str) -> CacheEntry<Arc<Manifest>> {
        self.fallback()?.get_scheduled_release(scheduled_id).await
    }

    async fn get_saved_release(&self) -> CacheEntry<Arc<Manifest>> {
        self.fallback()?.get_saved_release().await
    }

    async fn get_item(
        &self,
        collection_id: &str,
        item_id: &str,
        version: &ItemVersion,
    ) -> CacheEntry<Arc<Item>> {
        let key = CacheKey::item(collection_id, item_id, version);
        match self.load::<Item>(&key).await {
            Err(CacheError::NotFound) => {}
            result => return result.map(Arc::new),
        }

        let item = self
            .fallback()?
            .get_item(collection_id, item_id, version)
            .await?;
        self.store(&key, &item);

        Ok(item)
    }
}
