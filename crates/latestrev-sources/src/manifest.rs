use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ItemVersion, ReleaseVersion};

/// A single collection item.
///
/// Items are opaque JSON documents. They are content-addressed by their
/// `(collection, item, version)` triple.
pub type Item = serde_json::Value;

/// The item versions of a single collection, keyed by item id.
pub type CollectionVersions = BTreeMap<String, ItemVersion>;

/// A release manifest.
///
/// The manifest pins every item of every collection to the exact version that is part of the
/// release, and lists the media libraries the release refers to.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Manifest {
    /// The published version, absent for the saved (unpublished) working copy.
    #[serde(default)]
    pub version: Option<ReleaseVersion>,
    /// Item versions, keyed by collection id and then item id.
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionVersions>,
    /// Media libraries, keyed by library id.
    #[serde(default)]
    pub media: BTreeMap<String, MediaLibrary>,
}

impl Manifest {
    /// The manifest of a project that never published anything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Looks up the pinned version of an item.
    pub fn item_version(&self, collection_id: &str, item_id: &str) -> Option<&ItemVersion> {
        self.collections.get(collection_id)?.get(item_id)
    }

    /// Iterates over all `(collection, item, version)` triples of this manifest.
    pub fn items(&self) -> impl Iterator<Item = (&str, &str, &ItemVersion)> {
        self.collections.iter().flat_map(|(collection_id, items)| {
            items
                .iter()
                .map(move |(item_id, version)| (collection_id.as_str(), item_id.as_str(), version))
        })
    }
}

/// A media library referenced by a manifest.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaLibrary {
    /// The URL prefix under which the files of this library are publicly served.
    #[serde(default)]
    pub public_url: Option<String>,
}

/// A reference to a media file, as embedded inside of items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    /// The library the file lives in.
    pub library_id: String,
    /// The id of the file within its library.
    pub file_id: String,
    /// The file extension, without leading dot.
    pub extension: String,
}

impl MediaInfo {
    /// Parses a media reference out of an arbitrary item value.
    ///
    /// Returns `None` if the value is not an object or any of the required fields is missing,
    /// empty, or not a string.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let field = |name: &str| {
            object
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        Some(Self {
            library_id: field("libraryId")?,
            file_id: field("fileId")?,
            extension: field("extension")?,
        })
    }
}

/// The response of the "latest published release" endpoint.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ReleaseSummary {
    /// The latest published version, if anything was ever published.
    #[serde(default)]
    pub version: Option<ReleaseVersion>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let manifest: Manifest = serde_json::from_str("{}").unwrap();
        assert_eq!(manifest, Manifest::empty());
        assert!(manifest.version.is_none());

        let manifest: Manifest = serde_json::from_value(json!({
            "version": 4,
            "collections": {"posts": {"a": 1, "b": "2"}},
            "media": {"lib": {"publicUrl": "https://cdn.example.com/"}}
        }))
        .unwrap();
        assert_eq!(manifest.version, Some(ReleaseVersion(4)));
        assert_eq!(
            manifest.item_version("posts", "b"),
            Some(&ItemVersion::from(2))
        );
        assert_eq!(manifest.item_version("posts", "c"), None);
        assert_eq!(manifest.item_version("pages", "a"), None);
        assert_eq!(
            manifest.media["lib"].public_url.as_deref(),
            Some("https://cdn.example.com/")
        );
        assert_eq!(manifest.items().count(), 2);
    }

    #[test]
    fn test_media_info() {
        let info = MediaInfo::from_value(&json!({
            "libraryId": "lib",
            "fileId": "f1",
            "extension": "png",
            "alt": "ignored"
        }));
        assert_eq!(
            info,
            Some(MediaInfo {
                library_id: "lib".into(),
                file_id: "f1".into(),
                extension: "png".into(),
            })
        );

        assert_eq!(MediaInfo::from_value(&json!("lib/f1.png")), None);
        assert_eq!(
            MediaInfo::from_value(&json!({"libraryId": "lib", "fileId": "f1"})),
            None
        );
        assert_eq!(
            MediaInfo::from_value(&json!({"libraryId": "lib", "fileId": "", "extension": "png"})),
            None
        );
    }
}
