use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The version number of a published release.
///
/// Published releases are numbered monotonically, so the highest known version is the most
/// recent one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ReleaseVersion(pub u64);

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReleaseVersion {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for ReleaseVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

/// The version token of a single collection item.
///
/// The same `(collection, item, version)` triple always denotes the same content. The API sends
/// these either as numbers or strings, they are normalized to a string here.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemVersion(String);

impl ItemVersion {
    /// Creates a new item version from its textual form.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the textual form of this version.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemVersion {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

impl From<u64> for ItemVersion {
    fn from(version: u64) -> Self {
        Self(version.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            String(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self::from(n),
            Raw::String(s) => Self(s),
        })
    }
}

impl Serialize for ItemVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // numeric versions stay numeric on the wire
        match self.0.parse::<u64>() {
            Ok(n) if n.to_string() == self.0 => serializer.serialize_u64(n),
            _ => serializer.serialize_str(&self.0),
        }
    }
}
