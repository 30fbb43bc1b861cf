use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// The default location of the content API.
pub const DEFAULT_API_URL: &str = "https://latestrev.com/api/v1/";

/// An invalid or incomplete project configuration.
///
/// These errors are raised when the content source chain is constructed and are not recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No project id was configured.
    #[error("missing project id")]
    MissingProjectId,
    /// No API key was configured.
    #[error("missing project API key")]
    MissingApiKey,
    /// The API URL cannot be used as a base for project URLs.
    #[error("invalid API url `{0}`")]
    InvalidApiUrl(String),
}

/// Identifies a project on the authoritative content API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProjectSourceConfig {
    /// The project to load releases and items of.
    #[serde(default)]
    pub project_id: Option<String>,

    /// The root URL of the content API.
    #[serde(default = "default_api_url")]
    pub api_url: Url,

    /// The API key that is sent along with every request.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Timeout for a single request to the API.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_api_url() -> Url {
    // the constant is a valid URL
    Url::parse(DEFAULT_API_URL).unwrap()
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ProjectSourceConfig {
    /// Creates a config for the given project on the default API.
    pub fn new(project_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            api_url: default_api_url(),
            api_key: Some(api_key.into()),
            timeout: default_timeout(),
        }
    }

    /// Returns the configured project id, or an error if it is missing or empty.
    pub fn project_id(&self) -> Result<&str, ConfigurationError> {
        non_empty(&self.project_id).ok_or(ConfigurationError::MissingProjectId)
    }

    /// Returns the configured API key, or an error if it is missing or empty.
    pub fn api_key(&self) -> Result<&str, ConfigurationError> {
        non_empty(&self.api_key).ok_or(ConfigurationError::MissingApiKey)
    }

    /// The base URL all project endpoints are relative to: `<api_url>projects/<project_id>/`.
    pub fn project_url(&self) -> Result<Url, ConfigurationError> {
        let project_id = self.project_id()?;

        let mut api_url = self.api_url.clone();
        if api_url.cannot_be_a_base() {
            return Err(ConfigurationError::InvalidApiUrl(api_url.to_string()));
        }
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }

        api_url
            .join(&format!("projects/{project_id}/"))
            .map_err(|_| ConfigurationError::InvalidApiUrl(self.api_url.to_string()))
    }

    /// Checks that all required settings are present.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.project_url()?;
        self.api_key()?;
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
