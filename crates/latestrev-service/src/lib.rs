//! Resolution engine for LatestRev content.
//!
//! Content is resolved through a chain of [`ContentSource`](sources::ContentSource) tiers
//! (process memory, local files, the remote content API). The
//! [`ReleaseCoordinator`](coordinator::ReleaseCoordinator) hands out immutable
//! [`Snapshot`](snapshot::Snapshot)s of a release, reusing the published one for as long as the
//! published version does not change.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod snapshot;
pub mod sources;
pub mod utils;
