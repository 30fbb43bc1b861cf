//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function (e.g.
//!    `let cache_dir = latestrev_test::tempdir()`).
//!
//!  - When using [`ContentApi`], hold on to it until all requests to it have been made. The
//!    server stops when it is dropped, and requests to it will fail.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{OriginalUri, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use latestrev_sources::ProjectSourceConfig;

pub use tempfile::TempDir;

/// The project served by [`ContentApi`].
pub const PROJECT_ID: &str = "test-project";

/// The only API key accepted by [`ContentApi`].
pub const API_KEY: &str = "test-key";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `latestrev` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("latestrev=trace,latestrev_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves the given router on an ephemeral port.
    pub fn new(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct ApiState {
    hits: BTreeMap<String, usize>,
    fail_next: usize,
    fail_status: StatusCode,
    latest: Option<u64>,
    published: BTreeMap<u64, Value>,
    scheduled: BTreeMap<String, Value>,
    saved: Option<Value>,
    items: BTreeMap<(String, String, String), Value>,
}

type SharedState = Arc<Mutex<ApiState>>;

type ApiResult = Result<Json<Value>, StatusCode>;

/// A fake content API serving a single project, [`PROJECT_ID`].
///
/// Counts requests per path, requires [`API_KEY`], and can be told to fail requests. Nothing is
/// published initially.
pub struct ContentApi {
    server: Server,
    state: SharedState,
}

impl fmt::Debug for ContentApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentApi")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl ContentApi {
    pub fn new() -> Self {
        let state = SharedState::default();

        let project = Router::new()
            .route("/releases/published/latest", get(latest_release))
            .route("/releases/published/:version/manifest", get(published_release))
            .route("/releases/scheduled/:scheduled_id/manifest", get(scheduled_release))
            .route("/releases/saved/manifest", get(saved_release))
            .route("/collections/:collection/items/:item/:version", get(item));

        let router = Router::new()
            .nest(&format!("/api/v1/projects/{PROJECT_ID}"), project)
            .layer(middleware::from_fn_with_state(state.clone(), gatekeeper))
            .with_state(state.clone());

        let server = Server::new(router);
        Self { server, state }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().unwrap()
    }

    /// A source configuration pointing to this API.
    pub fn project_config(&self) -> ProjectSourceConfig {
        ProjectSourceConfig {
            project_id: Some(PROJECT_ID.to_owned()),
            api_url: self.server.url("api/v1/"),
            api_key: Some(API_KEY.to_owned()),
            timeout: Duration::from_secs(5),
        }
    }

    /// Adds a published release and makes it the latest one.
    ///
    /// # Panics
    ///
    /// Panics if the manifest has no numeric `version`.
    pub fn publish(&self, manifest: Value) {
        let version = manifest["version"].as_u64().expect("manifest without version");
        let mut state = self.state();
        state.latest = Some(version);
        state.published.insert(version, manifest);
    }

    pub fn add_scheduled(&self, scheduled_id: &str, manifest: Value) {
        self.state()
            .scheduled
            .insert(scheduled_id.to_owned(), manifest);
    }

    pub fn set_saved(&self, manifest: Value) {
        self.state().saved = Some(manifest);
    }

    pub fn add_item(&self, collection_id: &str, item_id: &str, version: impl fmt::Display, item: Value) {
        let key = (collection_id.to_owned(), item_id.to_owned(), version.to_string());
        self.state().items.insert(key, item);
    }

    /// Responds to the next `count` requests with a server error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next_with(count, StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Responds to the next `count` requests with `status`.
    pub fn fail_next_with(&self, count: usize, status: StatusCode) {
        let mut state = self.state();
        state.fail_next = count;
        state.fail_status = status;
    }

    /// Returns the number of requests since the last call and resets the counters.
    pub fn accesses(&self) -> usize {
        let hits = std::mem::take(&mut self.state().hits);
        hits.into_values().sum()
    }

    /// Returns the number of requests per path since the last call and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let hits = std::mem::take(&mut self.state().hits);
        hits.into_iter().collect()
    }

    /// Returns the number of requests to `path`, without resetting the counters.
    pub fn hits(&self, path: &str) -> usize {
        self.state().hits.get(path).copied().unwrap_or_default()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ContentApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts the request, then injects failures and checks the API key.
async fn gatekeeper(
    State(state): State<SharedState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<BTreeMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut state = state.lock().unwrap();
        *state.hits.entry(uri.path().to_owned()).or_default() += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return state.fail_status.into_response();
        }
    }

    if query.get("apiKey").map(String::as_str) != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, "invalid API key").into_response();
    }

    next.run(request).await
}

fn found(value: Option<&Value>) -> ApiResult {
    value.cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn latest_release(State(state): State<SharedState>) -> ApiResult {
    let latest = state.lock().unwrap().latest;
    Ok(Json(json!({ "version": latest })))
}

async fn published_release(
    State(state): State<SharedState>,
    Path(version): Path<u64>,
) -> ApiResult {
    found(state.lock().unwrap().published.get(&version))
}

async fn scheduled_release(
    State(state): State<SharedState>,
    Path(scheduled_id): Path<String>,
) -> ApiResult {
    found(state.lock().unwrap().scheduled.get(&scheduled_id))
}

async fn saved_release(State(state): State<SharedState>) -> ApiResult {
    found(state.lock().unwrap().saved.as_ref())
}

async fn item(
    State(state): State<SharedState>,
    Path(key): Path<(String, String, String)>,
) -> ApiResult {
    found(state.lock().unwrap().items.get(&key))
}
