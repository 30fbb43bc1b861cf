use std::fmt;

use latestrev_sources::{ItemVersion, ReleaseVersion};

/// Addresses a piece of version-pinned content in the durable and volatile tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The manifest of a published release.
    Release(ReleaseVersion),
    /// A single collection item at a fixed version.
    Item {
        collection_id: String,
        item_id: String,
        version: ItemVersion,
    },
}

impl CacheKey {
    /// Creates the key of an item.
    pub fn item(collection_id: &str, item_id: &str, version: &ItemVersion) -> Self {
        Self::Item {
            collection_id: collection_id.to_owned(),
            item_id: item_id.to_owned(),
            version: version.clone(),
        }
    }

    /// Returns the path of this entry relative to the cache root.
    ///
    /// Manifests live at `published/<version>.json`, items at
    /// `collections/<collection>/<item>-<version>.json`.
    pub fn cache_path(&self) -> String {
        match self {
            Self::Release(version) => format!("published/{version}.json"),
            Self::Item {
                collection_id,
                item_id,
                version,
            } => format!(
                "collections/{}/{}-{}.json",
                safe_path_segment(collection_id),
                safe_path_segment(item_id),
                safe_path_segment(version.as_str()),
            ),
        }
    }
}

/// The key used by the volatile tier: the version for releases, and
/// `<collection>-<item>-<version>` for items.
///
/// `-` and `\` within the segments of an item key are escaped with a `\`, so that distinct
/// items never share a key.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release(version) => write!(f, "{version}"),
            Self::Item {
                collection_id,
                item_id,
                version,
            } => write!(
                f,
                "{}-{}-{}",
                escape_key_segment(collection_id),
                escape_key_segment(item_id),
                escape_key_segment(version.as_str()),
            ),
        }
    }
}

fn escape_key_segment(s: &str) -> String {
    s.replace('\\', "\\\\").replace('-', "\\-")
}

fn safe_path_segment(s: &str) -> String {
    s.replace(['/', '\\', ':'], "_").replace("..", "__")
}
