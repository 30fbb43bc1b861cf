//! Decides which snapshot of a project's content is current.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use latestrev_sources::{ConfigurationError, Manifest, ReleaseVersion};

use crate::caching::{CacheEntry, CacheEntryExt, SingleFlightCache, StaleMode};
use crate::config::Config;
use crate::snapshot::Snapshot;
use crate::sources::{ContentSource, FileSource, MemorySource, RemoteSource};
use crate::utils::http::create_client;

/// The key of the current published snapshot.
const PUBLISHED: &str = "published";

/// Hands out snapshots of a project's releases.
///
/// The published snapshot is kept for the configured TTL. Once it turns stale, it keeps being
/// served while the latest version is looked up in the background, and it is only rebuilt when
/// that version actually changed. Scheduled and saved releases are drafts and are fetched anew
/// on every request.
#[derive(Clone, Debug)]
pub struct ReleaseCoordinator {
    source: Arc<dyn ContentSource>,
    cache: SingleFlightCache<Arc<Snapshot>>,
    chunk_size: usize,
}

impl ReleaseCoordinator {
    /// Creates a coordinator on top of the head of a source chain.
    pub fn new(source: Arc<dyn ContentSource>, published_ttl: Duration) -> Self {
        Self {
            source,
            cache: SingleFlightCache::new("snapshots", None).with_key_ttl(PUBLISHED, published_ttl),
            chunk_size: crate::sources::DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets how many items snapshots fetch concurrently.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Builds the source chain described by `config` and a coordinator on top of it.
    ///
    /// The chain consists of the content API, the file system cache if a `cache_dir` is
    /// configured, and the in-memory cache.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let project = config
            .project
            .as_ref()
            .ok_or(ConfigurationError::MissingProjectId)?;
        project.validate()?;

        let client = create_client(config.connect_timeout, project.timeout)
            .context("failed to create HTTP client")?;
        let remote = RemoteSource::new(project, client, config.retry)?;
        let mut source: Arc<dyn ContentSource> = Arc::new(remote);

        if let Some(cache_dir) = &config.cache_dir {
            std::fs::create_dir_all(cache_dir).with_context(|| {
                format!("failed to create cache directory {}", cache_dir.display())
            })?;
            let file = FileSource::new(cache_dir)
                .with_fallback(source)
                .with_chunk_size(config.fetch_chunk_size);
            source = Arc::new(file);
        }

        let source = Arc::new(MemorySource::new(source));
        Ok(Self::new(source, config.published_ttl).with_chunk_size(config.fetch_chunk_size))
    }

    fn snapshot(&self, manifest: Arc<Manifest>) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(manifest, Arc::clone(&self.source), self.chunk_size))
    }

    /// Looks up the latest published version and rebuilds the published snapshot if needed.
    ///
    /// The current snapshot is kept if the version did not change, or if nothing was ever
    /// published. Projects without any published release get an empty snapshot.
    pub async fn refresh_published(&self) -> CacheEntry<Arc<Snapshot>> {
        let existing = self.cache.get(PUBLISHED, true);
        let version = self
            .source
            .get_published_release_version(true)
            .await
            .found()?;

        let unchanged = existing.filter(|e| version.is_none() || e.version() == version);
        if let Some(existing) = unchanged {
            metric!(counter("coordinator.reuse") += 1);
            tracing::debug!(snapshot = existing.id(), "Published release unchanged");
            return Ok(existing);
        }

        let manifest = match version {
            Some(version) => self.source.get_published_release(version).await?,
            None => Arc::new(Manifest::empty()),
        };
        let snapshot = self.snapshot(manifest);

        metric!(counter("coordinator.rebuild") += 1);
        tracing::info!(snapshot = snapshot.id(), "Using new published release");
        self.cache.set(PUBLISHED, Arc::clone(&snapshot), None);
        Ok(snapshot)
    }

    /// Returns a published snapshot.
    ///
    /// Without a `version`, this is the current published snapshot, refreshed in the
    /// background once it turns stale. A specific version is fetched directly and not cached
    /// here. Returns `None` if that version does not exist.
    pub async fn get_published(
        &self,
        version: Option<ReleaseVersion>,
    ) -> CacheEntry<Option<Arc<Snapshot>>> {
        let Some(version) = version else {
            let coordinator = self.clone();
            let snapshot = self
                .cache
                .resolve(
                    PUBLISHED,
                    move || async move { coordinator.refresh_published().await },
                    None,
                    StaleMode::Lazy,
                )
                .await?;
            return Ok(Some(snapshot));
        };

        let manifest = self.source.get_published_release(version).await.found()?;
        Ok(manifest.map(|manifest| self.snapshot(manifest)))
    }

    /// Returns a snapshot of a scheduled release, or `None` if it does not exist.
    pub async fn get_scheduled(&self, scheduled_id: &str) -> CacheEntry<Option<Arc<Snapshot>>> {
        let manifest = self
            .source
            .get_scheduled_release(scheduled_id)
            .await
            .found()?;
        Ok(manifest.map(|manifest| self.snapshot(manifest)))
    }

    /// Returns a snapshot of the saved working copy, or `None` if there is none.
    pub async fn get_saved(&self) -> CacheEntry<Option<Arc<Snapshot>>> {
        let manifest = self.source.get_saved_release().await.found()?;
        Ok(manifest.map(|manifest| self.snapshot(manifest)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use latestrev_sources::ProjectSourceConfig;
    use latestrev_test::ContentApi;

    use crate::caching::CacheError;
    use crate::test::{MockSource, Operation};

    use super::*;

    fn coordinator(mock: &Arc<MockSource>, ttl: Duration) -> ReleaseCoordinator {
        ReleaseCoordinator::new(mock.clone(), ttl)
    }

    #[tokio::test]
    async fn test_unchanged_version_reuses_snapshot() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 3);
        let coordinator = coordinator(&mock, Duration::from_secs(60));

        let first = coordinator.refresh_published().await.unwrap();
        assert_eq!(first.id(), "published-1");
        first.get_items("posts").await.unwrap();

        let second = coordinator.refresh_published().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // the memoized items survive as well
        second.get_items("posts").await.unwrap();

        assert_eq!(mock.calls(Operation::GetPublishedReleaseVersion), 2);
        assert_eq!(mock.calls(Operation::GetPublishedRelease), 1);
        assert_eq!(mock.calls(Operation::GetItem), 3);

        mock.publish_collection(ReleaseVersion(2), "posts", 3);
        let third = coordinator.refresh_published().await.unwrap();
        assert_eq!(third.id(), "published-2");
        assert_eq!(mock.calls(Operation::GetPublishedRelease), 2);
    }

    #[tokio::test]
    async fn test_never_published() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        let coordinator = coordinator(&mock, Duration::from_secs(60));

        let snapshot = coordinator.refresh_published().await.unwrap();
        assert!(snapshot.manifest().collections.is_empty());
        assert!(snapshot.manifest().media.is_empty());
        assert_eq!(snapshot.version(), None);
        assert!(!snapshot.id().starts_with("published-"));
        assert_eq!(mock.calls(Operation::GetPublishedRelease), 0);

        // still nothing published, keep the empty snapshot
        let again = coordinator.refresh_published().await.unwrap();
        assert!(Arc::ptr_eq(&snapshot, &again));

        mock.publish_collection(ReleaseVersion(1), "posts", 1);
        let published = coordinator.refresh_published().await.unwrap();
        assert_eq!(published.id(), "published-1");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 1);
        let coordinator = coordinator(&mock, Duration::from_secs(60));
        let first = coordinator.refresh_published().await.unwrap();

        mock.publish_collection(ReleaseVersion(2), "posts", 1);
        mock.fail(
            Operation::GetPublishedRelease,
            CacheError::DownloadError("503".into()),
        );
        assert_eq!(
            coordinator.refresh_published().await.unwrap_err(),
            CacheError::DownloadError("503".into())
        );

        let current = coordinator.get_published(None).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[tokio::test]
    async fn test_published_is_refreshed_lazily() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 1);
        let coordinator = coordinator(&mock, Duration::from_millis(200));

        let first = coordinator.get_published(None).await.unwrap().unwrap();
        assert_eq!(first.id(), "published-1");

        mock.publish_collection(ReleaseVersion(2), "posts", 1);
        // still fresh
        let cached = coordinator.get_published(None).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));
        assert_eq!(mock.calls(Operation::GetPublishedReleaseVersion), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // stale, served while the refresh happens in the background
        let stale = coordinator.get_published(None).await.unwrap().unwrap();
        assert_eq!(stale.id(), "published-1");

        let refreshed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = coordinator.get_published(None).await.unwrap().unwrap();
                if snapshot.id() == "published-2" {
                    break snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(refreshed.version(), Some(ReleaseVersion(2)));
        assert_eq!(mock.calls(Operation::GetPublishedReleaseVersion), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_once() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new().with_delay(Duration::from_millis(20)));
        mock.publish_collection(ReleaseVersion(1), "posts", 1);
        let coordinator = coordinator(&mock, Duration::from_secs(60));

        let snapshots = futures::future::join_all((0..10).map(|_| coordinator.get_published(None)))
            .await
            .into_iter()
            .map(|s| s.unwrap().unwrap())
            .collect::<Vec<_>>();

        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
        assert_eq!(mock.calls(Operation::GetPublishedReleaseVersion), 1);
        assert_eq!(mock.calls(Operation::GetPublishedRelease), 1);
    }

    #[tokio::test]
    async fn test_pinned_versions_and_drafts_are_not_cached() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 1);
        mock.publish_collection(ReleaseVersion(2), "posts", 1);
        mock.set_saved(Manifest::empty());
        mock.add_scheduled("next", Manifest::empty());
        let coordinator = coordinator(&mock, Duration::from_secs(60));

        let pinned = coordinator
            .get_published(Some(ReleaseVersion(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.id(), "published-1");
        let missing = coordinator.get_published(Some(ReleaseVersion(9))).await;
        assert!(missing.unwrap().is_none());
        // pinned snapshots do not replace the current one
        let current = coordinator.get_published(None).await.unwrap().unwrap();
        assert_eq!(current.id(), "published-2");

        for _ in 0..2 {
            let saved = coordinator.get_saved().await.unwrap().unwrap();
            assert_eq!(saved.version(), None);
            assert!(coordinator.get_scheduled("next").await.unwrap().is_some());
        }
        assert_eq!(mock.calls(Operation::GetSavedRelease), 2);
        assert_eq!(mock.calls(Operation::GetScheduledRelease), 2);

        assert!(coordinator.get_scheduled("other").await.unwrap().is_none());

        mock.fail(Operation::GetSavedRelease, CacheError::Timeout(Duration::from_secs(1)));
        assert_eq!(
            coordinator.get_saved().await.map(|s| s.is_some()),
            Err(CacheError::Timeout(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn test_from_config() {
        latestrev_test::setup();

        let mut config = Config::default();
        assert!(ReleaseCoordinator::from_config(&config).is_err());

        config.project = Some(ProjectSourceConfig {
            api_key: None,
            ..ProjectSourceConfig::new("p", "k")
        });
        let err = ReleaseCoordinator::from_config(&config).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigurationError>(),
            Some(&ConfigurationError::MissingApiKey)
        );

        let api = ContentApi::new();
        api.publish(json!({"version": 5, "collections": {"posts": {"a": 1, "b": 1}}}));
        api.add_item("posts", "a", 1, json!({"title": "A"}));
        api.add_item("posts", "b", 1, json!({"title": "B"}));

        let cache_dir = latestrev_test::tempdir();
        config.project = Some(api.project_config());
        config.cache_dir = Some(cache_dir.path().join("content"));
        let coordinator = ReleaseCoordinator::from_config(&config).unwrap();

        let snapshot = coordinator.get_published(None).await.unwrap().unwrap();
        assert_eq!(snapshot.id(), "published-5");
        // version, manifest, and both items prefetched by the file system tier
        assert_eq!(api.accesses(), 4);

        assert_eq!(snapshot.get_items("posts").await.unwrap().len(), 2);
        assert_eq!(api.accesses(), 0);
        assert!(cache_dir.path().join("content/published/5.json").is_file());
        assert!(
            cache_dir
                .path()
                .join("content/collections/posts/a-1.json")
                .is_file()
        );

        let item = snapshot.get_item("posts", "b").await.unwrap().unwrap();
        assert_eq!(*item, json!({"title": "B"}));
        assert_eq!(api.accesses(), 0);
    }

    #[tokio::test]
    async fn test_release_pinning_deleted_items() {
        latestrev_test::setup();

        let api = ContentApi::new();
        api.publish(json!({"version": 1, "collections": {"posts": {"a": 1, "gone": 1}}}));
        api.add_item("posts", "a", 1, json!({"title": "A"}));

        let cache_dir = latestrev_test::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            project: Some(api.project_config()),
            ..Config::default()
        };
        let coordinator = ReleaseCoordinator::from_config(&config).unwrap();

        let snapshot = coordinator.get_published(None).await.unwrap().unwrap();
        assert_eq!(snapshot.id(), "published-1");
        assert!(cache_dir.path().join("published/1.json").is_file());

        let items = snapshot.get_items("posts").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(*items[0], json!({"title": "A"}));
        assert!(snapshot.get_item("posts", "gone").await.unwrap().is_none());
    }
}
