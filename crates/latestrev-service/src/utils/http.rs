use std::error::Error;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::caching::{CacheEntry, CacheError};
use crate::config::RetryConfig;

impl CacheError {
    /// Builds a [`DownloadError`](CacheError::DownloadError) from the root cause of `error`.
    pub fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// Creates the [`reqwest::Client`] used to talk to the content API.
pub fn create_client(connect_timeout: Duration, timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(concat!("latestrev/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Runs the future created by `task_gen` until it succeeds, at most `max_attempts` times.
///
/// Only transient errors are retried. The delay between attempts starts at
/// `initial_backoff`, doubles after every attempt, and is capped at `max_backoff`. Up to a
/// quarter of random jitter is added on top.
pub async fn retry<G, F, T>(config: &RetryConfig, task_gen: G) -> CacheEntry<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheEntry<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_retry = matches!(&result, Err(err) if err.is_transient());
        if !should_retry || tries >= config.max_attempts {
            break result;
        }

        let delay = backoff(config, tries);
        if let Err(err) = &result {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                attempt = tries,
                ?delay,
                "Retrying failed request",
            );
        }
        tokio::time::sleep(delay).await;
    }
}

/// The delay after the `attempt`th failed attempt, starting at 1.
fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config
        .initial_backoff
        .saturating_mul(1 << exponent)
        .min(config.max_backoff);
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    base + base.mul_f64(jitter)
}
