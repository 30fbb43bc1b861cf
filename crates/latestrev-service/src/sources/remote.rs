use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use latestrev_sources::{
    ConfigurationError, Item, ItemVersion, Manifest, ProjectSourceConfig, ReleaseSummary,
    ReleaseVersion,
};

use crate::caching::{CacheEntry, CacheError};
use crate::config::RetryConfig;
use crate::utils::http::retry;

use super::ContentSource;

/// The authoritative tier, talking to the content API over HTTP.
///
/// Reads are retried according to the [`RetryConfig`]. Only `404` and `410` responses mean the
/// content is absent. Rate limiting, request timeouts and server errors are retried.
pub struct RemoteSource {
    client: reqwest::Client,
    project_url: Url,
    api_key: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("project_url", &self.project_url.as_str())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RemoteSource {
    /// Creates a source for the configured project.
    ///
    /// Fails if the project id or the API key is missing.
    pub fn new(
        config: &ProjectSourceConfig,
        client: reqwest::Client,
        retry: RetryConfig,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client,
            project_url: config.project_url()?,
            api_key: config.api_key()?.to_owned(),
            timeout: config.timeout,
            retry,
        })
    }

    fn url(&self, segments: &[&str]) -> CacheEntry<Url> {
        let mut url = self.project_url.clone();
        url.path_segments_mut()
            .map_err(|_| CacheError::InternalError)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Fetches and parses the JSON document at `segments`, retrying transient failures.
    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        segments: &[&str],
    ) -> CacheEntry<T> {
        let url = self.url(segments)?;
        let result = retry(&self.retry, || self.fetch_once(endpoint, url.clone())).await;

        match &result {
            Ok(_) => tracing::debug!(endpoint, "Fetched content from API"),
            Err(CacheError::NotFound) => tracing::debug!(endpoint, "Content not found in API"),
            Err(err) => tracing::debug!(
                error = err as &dyn std::error::Error,
                endpoint,
                "Failed to fetch content from API"
            ),
        }

        result
    }

    async fn fetch_once<T: DeserializeOwned>(&self, endpoint: &'static str, url: Url) -> CacheEntry<T> {
        let request = self
            .client
            .get(url)
            .query(&[("apiKey", &self.api_key)])
            .header("Accept", "application/json")
            .timeout(self.timeout);

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        metric!(
            counter("source.remote.request") += 1,
            "endpoint" => endpoint,
            "status" => status.as_str(),
        );

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let details = response.text().await.unwrap_or_default();
            let details = match details.trim() {
                "" => status.to_string(),
                body => format!("{status}: {body}"),
            };
            return Err(CacheError::PermissionDenied(details));
        }
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Err(CacheError::NotFound),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                return Err(CacheError::DownloadError(status.to_string()));
            }
            _ if status.is_client_error() => return Err(CacheError::Rejected(status.to_string())),
            _ if !status.is_success() => return Err(CacheError::DownloadError(status.to_string())),
            _ => {}
        }

        let body = response.bytes().await.map_err(|e| self.request_error(e))?;
        // an empty or `null` body means there is nothing there
        let value: Option<T> = match body.trim_ascii() {
            b"" => None,
            body => serde_json::from_slice(body)?,
        };
        value.ok_or(CacheError::NotFound)
    }

    fn request_error(&self, error: reqwest::Error) -> CacheError {
        if error.is_timeout() {
            CacheError::Timeout(self.timeout)
        } else {
            error.into()
        }
    }
}

#[async_trait]
impl ContentSource for RemoteSource {
    async fn get_published_release_version(&self, _ignore_cache: bool) -> CacheEntry<ReleaseVersion> {
        let summary: ReleaseSummary = self
            .fetch("published_version", &["releases", "published", "latest"])
            .await?;
        summary.version.ok_or(CacheError::NotFound)
    }

    async fn get_published_release(&self, version: ReleaseVersion) -> CacheEntry<Arc<Manifest>> {
        let version_str = version.to_string();
        let mut manifest: Manifest = self
            .fetch(
                "published_release",
                &["releases", "published", &version_str, "manifest"],
            )
            .await?;
        manifest.version.get_or_insert(version);
        Ok(Arc::new(manifest))
    }

    async fn get_scheduled_release(&self, scheduled_id: &str) -> CacheEntry<Arc<Manifest>> {
        let manifest: Manifest = self
            .fetch(
                "scheduled_release",
                &["releases", "scheduled", scheduled_id, "manifest"],
            )
            .await?;
        Ok(Arc::new(manifest))
    }

    async fn get_saved_release(&self) -> CacheEntry<Arc<Manifest>> {
        let manifest: Manifest = self
            .fetch("saved_release", &["releases", "saved", "manifest"])
            .await?;
        Ok(Arc::new(manifest))
    }

    async fn get_item(
        &self,
        collection_id: &str,
        item_id: &str,
        version: &ItemVersion,
    ) -> CacheEntry<Arc<Item>> {
        let item: Item = self
            .fetch(
                "item",
                &["collections", collection_id, "items", item_id, version.as_str()],
            )
            .await?;
        Ok(Arc::new(item))
    }
}
