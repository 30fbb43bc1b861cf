//! Point-in-time views over a single release manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use latestrev_sources::{Item, ItemVersion, Manifest, MediaInfo, ReleaseVersion};

use crate::caching::{CacheEntry, CacheEntryExt, CacheError, SingleFlightCache, StaleMode};
use crate::sources::ContentSource;
use crate::utils::futures::join_chunked;

/// The resolved items of a collection.
pub type CollectionItems = Arc<Vec<Arc<Item>>>;

/// Localized strings of a collection, keyed by item id.
pub type LocalizedLookup = Arc<BTreeMap<String, String>>;

/// Everything known about a media file referenced by an item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDetails {
    pub library_id: String,
    pub file_id: String,
    pub extension: String,
    /// The public URL prefix of the library.
    pub public_url: String,
    /// The public URL of the file itself.
    pub url: String,
}

/// An immutable view over one release manifest.
///
/// Items are resolved lazily through the source chain using the versions pinned by the
/// manifest. Whole collections and localized lookups are memoized for the lifetime of the
/// snapshot. Cloning is cheap and clones share their memoized results.
#[derive(Clone)]
pub struct Snapshot {
    id: Arc<str>,
    manifest: Arc<Manifest>,
    source: Arc<dyn ContentSource>,
    chunk_size: usize,
    collections: moka::future::Cache<String, CollectionItems>,
    lookups: SingleFlightCache<LocalizedLookup>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("version", &self.manifest.version)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    /// Creates a snapshot of `manifest` that resolves items through `source`.
    ///
    /// Published manifests get the id `published-<version>`, all others are identified by the
    /// time of their creation.
    pub fn new(manifest: Arc<Manifest>, source: Arc<dyn ContentSource>, chunk_size: usize) -> Self {
        let id = match manifest.version {
            Some(version) => format!("published-{version}"),
            None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        Self {
            id: id.into(),
            manifest,
            source,
            chunk_size,
            collections: moka::future::Cache::builder().build(),
            lookups: SingleFlightCache::new("localized_lookups", None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// The published version, `None` for drafts and projects that never published.
    pub fn version(&self) -> Option<ReleaseVersion> {
        self.manifest.version
    }

    /// Resolves a single item at the version pinned by the manifest.
    ///
    /// Returns `None` if the manifest does not contain the item, or the item does not exist.
    pub async fn get_item(&self, collection_id: &str, item_id: &str) -> CacheEntry<Option<Arc<Item>>> {
        let Some(version) = self.manifest.item_version(collection_id, item_id) else {
            return Ok(None);
        };
        self.source
            .get_item(collection_id, item_id, version)
            .await
            .found()
    }

    /// Resolves all items of a collection, in item id order.
    ///
    /// Items are fetched in chunks of bounded concurrency. Items that turn out to be missing
    /// are skipped. The result is memoized, failures are not.
    pub async fn get_items(&self, collection_id: &str) -> CacheEntry<CollectionItems> {
        let Some(versions) = self.manifest.collections.get(collection_id) else {
            return Ok(Arc::default());
        };

        let init = async {
            let items = self.fetch_collection(collection_id, versions).await?;
            let items: Vec<_> = items.into_iter().filter_map(|(_, item)| item).collect();
            Ok::<_, CacheError>(Arc::new(items))
        };

        self.collections
            .try_get_with(collection_id.to_owned(), init)
            .await
            .map_err(|err: Arc<_>| (*err).clone())
    }

    async fn fetch_collection(
        &self,
        collection_id: &str,
        versions: &BTreeMap<String, ItemVersion>,
    ) -> CacheEntry<Vec<(String, Option<Arc<Item>>)>> {
        tracing::debug!(
            snapshot = %self.id,
            collection = collection_id,
            items = versions.len(),
            "Resolving collection",
        );

        join_chunked(versions, self.chunk_size, |(item_id, version)| async move {
            let item = self
                .source
                .get_item(collection_id, item_id, version)
                .await
                .found()?;
            Ok::<_, CacheError>((item_id.clone(), item))
        })
        .await
    }

    /// Builds the public URL of a media file referenced by an item.
    ///
    /// Returns `None` if the reference is incomplete or its library has no public URL.
    pub fn get_media_url(&self, media_info: &serde_json::Value) -> Option<String> {
        self.get_media_details(media_info).map(|details| details.url)
    }

    /// Looks up a media reference in the manifest's media libraries.
    pub fn get_media_details(&self, media_info: &serde_json::Value) -> Option<MediaDetails> {
        let MediaInfo {
            library_id,
            file_id,
            extension,
        } = MediaInfo::from_value(media_info)?;

        let public_url = self
            .manifest
            .media
            .get(&library_id)?
            .public_url
            .as_deref()
            .filter(|url| !url.is_empty())?
            .to_owned();
        let url = format!("{public_url}{file_id}.{extension}");

        Some(MediaDetails {
            library_id,
            file_id,
            extension,
            public_url,
            url,
        })
    }

    /// Resolves the text of a localizable item.
    ///
    /// The selected variant of `locale` wins. Otherwise the item's source text is used if
    /// `fallback_to_source` is set, and then the item id itself if `fallback_to_id` is set.
    pub async fn get_localized_string(
        &self,
        collection_id: &str,
        item_id: &str,
        locale: &str,
        fallback_to_source: bool,
        fallback_to_id: bool,
    ) -> CacheEntry<Option<String>> {
        let item = self.get_item(collection_id, item_id).await?;
        Ok(localize(
            item.as_deref(),
            item_id,
            locale,
            fallback_to_source,
            fallback_to_id,
        ))
    }

    /// Resolves the localized strings of all items of a collection.
    ///
    /// Uses the same fallbacks as [`get_localized_string`](Self::get_localized_string), items
    /// that resolve to nothing are left out. The result is memoized per collection, locale and
    /// fallbacks.
    pub async fn get_localized_lookup(
        &self,
        collection_id: &str,
        locale: &str,
        fallback_to_source: bool,
        fallback_to_id: bool,
    ) -> CacheEntry<LocalizedLookup> {
        let key = format!("{collection_id}:{locale}:{fallback_to_source}:{fallback_to_id}");

        let snapshot = self.clone();
        let collection_id = collection_id.to_owned();
        let locale = locale.to_owned();
        let factory = move || async move {
            let Some(versions) = snapshot.manifest.collections.get(&collection_id) else {
                return Ok(Arc::default());
            };
            let items = snapshot.fetch_collection(&collection_id, versions).await?;

            let lookup = items
                .into_iter()
                .filter_map(|(item_id, item)| {
                    let text = localize(
                        item.as_deref(),
                        &item_id,
                        &locale,
                        fallback_to_source,
                        fallback_to_id,
                    )?;
                    Some((item_id, text))
                })
                .collect();
            Ok::<_, CacheError>(Arc::new(lookup))
        };

        self.lookups
            .resolve(&key, factory, None, StaleMode::Blocking)
            .await
    }
}

/// Picks the text of an item: the selected variant of `locale`, then the source text, then
/// the item id. Empty strings count as missing.
fn localize(
    item: Option<&Item>,
    item_id: &str,
    locale: &str,
    fallback_to_source: bool,
    fallback_to_id: bool,
) -> Option<String> {
    let text = |value: Option<&serde_json::Value>| {
        value
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    let selected = item.and_then(|item| text(item.get(locale)?.get("selected")));
    selected
        .or_else(|| {
            fallback_to_source
                .then(|| item.and_then(|item| text(item.get("source"))))
                .flatten()
        })
        .or_else(|| fallback_to_id.then(|| item_id.to_owned()))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::caching::CacheError;
    use crate::test::{MockSource, Operation};

    use super::*;

    async fn snapshot(mock: &Arc<MockSource>, version: u64, chunk_size: usize) -> Snapshot {
        let manifest = mock
            .get_published_release(ReleaseVersion(version))
            .await
            .unwrap();
        Snapshot::new(manifest, mock.clone(), chunk_size)
    }

    fn strings_manifest() -> Manifest {
        serde_json::from_value(json!({
            "version": 1,
            "collections": {"strings": {"greeting": 1, "farewell": 1, "untranslated": 1, "gone": 1}},
            "media": {
                "images": {"publicUrl": "https://cdn.example.com/images/"},
                "private": {}
            }
        }))
        .unwrap()
    }

    fn strings_source() -> Arc<MockSource> {
        let mock = Arc::new(MockSource::new());
        mock.add_item(
            "strings",
            "greeting",
            ItemVersion::from(1),
            json!({"source": "Hello", "de": {"selected": "Hallo"}, "fr": {"selected": ""}}),
        );
        mock.add_item(
            "strings",
            "farewell",
            ItemVersion::from(1),
            json!({"source": "Goodbye"}),
        );
        mock.add_item("strings", "untranslated", ItemVersion::from(1), json!({}));
        mock.publish(strings_manifest());
        mock
    }

    #[test]
    fn test_ids() {
        let mock = Arc::new(MockSource::new());
        let published = Manifest {
            version: Some(ReleaseVersion(7)),
            ..Manifest::empty()
        };
        let snapshot = Snapshot::new(Arc::new(published), mock.clone(), 25);
        assert_eq!(snapshot.id(), "published-7");
        assert_eq!(snapshot.version(), Some(ReleaseVersion(7)));

        let draft = Snapshot::new(Arc::new(Manifest::empty()), mock, 25);
        assert!(!draft.id().starts_with("published-"));
        assert!(chrono::DateTime::parse_from_rfc3339(draft.id()).is_ok());
        assert_eq!(draft.version(), None);
    }

    #[tokio::test]
    async fn test_get_item() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 2);
        let snapshot = snapshot(&mock, 1, 25).await;

        let item = snapshot.get_item("posts", "item-1").await.unwrap();
        assert_eq!(item.as_deref(), Some(&json!({"id": "item-1"})));

        assert_eq!(snapshot.get_item("posts", "item-9").await, Ok(None));
        assert_eq!(snapshot.get_item("pages", "item-1").await, Ok(None));
        // items that are not part of the manifest are never requested
        assert_eq!(mock.calls(Operation::GetItem), 1);
    }

    #[tokio::test]
    async fn test_get_items_is_chunked_and_memoized() {
        latestrev_test::setup();

        let delay = Duration::from_millis(10);
        let mock = Arc::new(MockSource::new().with_delay(delay));
        mock.publish_collection(ReleaseVersion(1), "posts", 100);
        let snapshot = snapshot(&mock, 1, 25).await;

        let start = Instant::now();
        let (a, b) = futures::join!(snapshot.get_items("posts"), snapshot.get_items("posts"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.len(), 100);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mock.calls(Operation::GetItem), 100);
        assert_eq!(mock.max_in_flight(Operation::GetItem), 25);
        // four sequential waves
        assert!(start.elapsed() >= delay * 4);

        let again = snapshot.get_items("posts").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(mock.calls(Operation::GetItem), 100);

        assert!(snapshot.get_items("pages").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_items_skips_missing_items() {
        latestrev_test::setup();

        let mock = strings_source();
        let snapshot = snapshot(&mock, 1, 2).await;

        let items = snapshot.get_items("strings").await.unwrap();
        // `gone` is pinned by the manifest but does not exist
        assert_eq!(items.len(), 3);
        assert_eq!(*items[0], json!({"source": "Goodbye"}));
    }

    #[tokio::test]
    async fn test_get_items_failures_are_not_memoized() {
        latestrev_test::setup();

        let mock = Arc::new(MockSource::new());
        mock.publish_collection(ReleaseVersion(1), "posts", 5);
        let snapshot = snapshot(&mock, 1, 2).await;

        mock.fail(Operation::GetItem, CacheError::DownloadError("502".into()));
        assert_eq!(
            snapshot.get_items("posts").await,
            Err(CacheError::DownloadError("502".into()))
        );

        mock.clear_failures();
        assert_eq!(snapshot.get_items("posts").await.unwrap().len(), 5);
    }

    #[test]
    fn test_media() {
        let snapshot = Snapshot::new(
            Arc::new(strings_manifest()),
            Arc::new(MockSource::new()),
            25,
        );

        let info = json!({"libraryId": "images", "fileId": "cat", "extension": "jpg"});
        assert_eq!(
            snapshot.get_media_url(&info).as_deref(),
            Some("https://cdn.example.com/images/cat.jpg")
        );
        let details = snapshot.get_media_details(&info).unwrap();
        assert_eq!(details.public_url, "https://cdn.example.com/images/");
        assert_eq!(details.file_id, "cat");

        for info in [
            json!(null),
            json!("cat.jpg"),
            json!({"libraryId": "images", "fileId": "cat"}),
            json!({"libraryId": "videos", "fileId": "cat", "extension": "jpg"}),
            json!({"libraryId": "private", "fileId": "cat", "extension": "jpg"}),
        ] {
            assert_eq!(snapshot.get_media_url(&info), None);
            assert_eq!(snapshot.get_media_details(&info), None);
        }
    }

    #[tokio::test]
    async fn test_localized_string_fallbacks() {
        latestrev_test::setup();

        let mock = strings_source();
        let snapshot = snapshot(&mock, 1, 25).await;
        let get = |item_id, locale, to_source, to_id| {
            snapshot.get_localized_string("strings", item_id, locale, to_source, to_id)
        };

        assert_eq!(get("greeting", "de", true, true).await, Ok(Some("Hallo".into())));
        // empty variants count as missing
        assert_eq!(get("greeting", "fr", true, true).await, Ok(Some("Hello".into())));
        assert_eq!(get("farewell", "de", true, true).await, Ok(Some("Goodbye".into())));
        assert_eq!(get("farewell", "de", false, true).await, Ok(Some("farewell".into())));
        assert_eq!(get("farewell", "de", false, false).await, Ok(None));
        assert_eq!(get("untranslated", "de", true, false).await, Ok(None));
        assert_eq!(get("unknown", "de", true, true).await, Ok(Some("unknown".into())));
    }

    #[tokio::test]
    async fn test_localized_lookup() {
        latestrev_test::setup();

        let mock = strings_source();
        let snapshot = snapshot(&mock, 1, 25).await;

        let lookup = snapshot
            .get_localized_lookup("strings", "de", true, false)
            .await
            .unwrap();
        assert_eq!(
            *lookup,
            BTreeMap::from([
                ("farewell".to_owned(), "Goodbye".to_owned()),
                ("greeting".to_owned(), "Hallo".to_owned()),
            ])
        );
        let calls = mock.calls(Operation::GetItem);

        let again = snapshot
            .get_localized_lookup("strings", "de", true, false)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&lookup, &again));
        assert_eq!(mock.calls(Operation::GetItem), calls);

        let with_ids = snapshot
            .get_localized_lookup("strings", "de", false, true)
            .await
            .unwrap();
        assert_eq!(with_ids.len(), 4);
        assert_eq!(with_ids["farewell"], "farewell");
        assert_eq!(with_ids["greeting"], "Hallo");

        let missing = snapshot
            .get_localized_lookup("pages", "de", true, true)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
