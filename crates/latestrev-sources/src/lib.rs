//! Data model of the LatestRev content API.
//!
//! Includes release manifests, collection items, media libraries and the configuration that
//! identifies a project on the authoritative content API.

#![warn(missing_docs)]

mod manifest;
mod project;
mod types;

pub use manifest::*;
pub use project::*;
pub use types::*;
