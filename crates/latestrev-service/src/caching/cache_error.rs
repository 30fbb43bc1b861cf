use std::time::Duration;

use thiserror::Error;

/// An error that happens when resolving content from one of the source tiers.
///
/// This is `Clone` so that a single failed computation can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested release, version or item does not exist.
    ///
    /// This is not really an error, and consumers of a snapshot only ever see it as `None`.
    #[error("not found")]
    NotFound,
    /// The content API rejected our credentials.
    ///
    /// The attached string contains the API's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A request to the content API timed out.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The content could not be fetched due to another problem, like connection loss, DNS
    /// resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The content API refused the request for a reason other than credentials, like a
    /// malformed request. Retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The content was fetched successfully, but could not be parsed.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error, like a failing disk.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl CacheError {
    /// Logs the given error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether a failed request may succeed when it is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::DownloadError(_) | Self::InternalError
        )
    }

    /// A short name for this error, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Rejected(_) => "rejected",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internalerror",
        }
    }
}

/// The result of resolving a piece of content, containing either `Ok(T)` or an error denoting
/// the reason why it could not be resolved.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

/// Extension to turn the [`NotFound`](CacheError::NotFound) case of a [`CacheEntry`] into an
/// `Option`.
pub trait CacheEntryExt<T> {
    /// Maps `Err(NotFound)` to `Ok(None)`, keeping every other error.
    fn found(self) -> CacheEntry<Option<T>>;
}

impl<T> CacheEntryExt<T> for CacheEntry<T> {
    fn found(self) -> CacheEntry<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(CacheError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
