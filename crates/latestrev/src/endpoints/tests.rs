use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{COOKIE, EXPIRES, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use latestrev_service::caching::CacheError;
use latestrev_service::config::Config;
use latestrev_service::coordinator::ReleaseCoordinator;
use latestrev_service::test::{MockSource, Operation};
use latestrev_sources::{ItemVersion, Manifest, ReleaseVersion};
use latestrev_test::{ContentApi, Server};

use super::create_app;

fn serve(mock: &Arc<MockSource>) -> Server {
    let coordinator = ReleaseCoordinator::new(mock.clone(), Duration::from_secs(60));
    Server::new(create_app(coordinator))
}

async fn get_json(server: &Server, path: &str) -> (StatusCode, Value) {
    let response = Client::new().get(server.url(path)).send().await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

fn draft(collections: Value) -> Manifest {
    serde_json::from_value(json!({ "collections": collections })).unwrap()
}

#[tokio::test]
async fn test_healthcheck() {
    latestrev_test::setup();

    let server = serve(&Arc::new(MockSource::new()));
    let response = Client::new()
        .get(server.url("/healthcheck"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_published_content() {
    latestrev_test::setup();

    let mock = Arc::new(MockSource::new());
    mock.publish_collection(ReleaseVersion(1), "posts", 3);
    let server = serve(&mock);

    let (status, snapshot) = get_json(&server, "/snapshot").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot, json!({"id": "published-1", "version": 1}));

    let (status, items) = get_json(&server, "/collections/posts/items").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        items,
        json!([{"id": "item-0"}, {"id": "item-1"}, {"id": "item-2"}])
    );

    let (status, item) = get_json(&server, "/collections/posts/items/item-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item, json!({"id": "item-1"}));

    let (status, error) = get_json(&server, "/collections/posts/items/item-7").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["detail"], "item not found");

    let (status, items) = get_json(&server, "/collections/pages/items").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items, json!([]));

    // all requests shared the cached published snapshot
    assert_eq!(mock.calls(Operation::GetPublishedReleaseVersion), 1);
}

#[tokio::test]
async fn test_saved_selection_is_remembered() {
    latestrev_test::setup();

    let mock = Arc::new(MockSource::new());
    mock.publish_collection(ReleaseVersion(1), "posts", 1);
    mock.set_saved(draft(json!({"posts": {"draft": 1}})));
    mock.add_item("posts", "draft", ItemVersion::from(1), json!({"title": "Draft"}));
    let server = serve(&mock);
    let client = Client::new();

    let response = client
        .get(server.url("/collections/posts/items/draft?cms=saved"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_owned();
    assert_eq!(cookie, "cms=saved; Path=/");
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"title": "Draft"})
    );

    let response = client
        .get(server.url("/snapshot"))
        .header(COOKIE, "cms=saved")
        .send()
        .await
        .unwrap();
    assert!(response.headers().get(SET_COOKIE).is_none());
    let snapshot: Value = response.json().await.unwrap();
    assert_eq!(snapshot["version"], Value::Null);
    assert!(!snapshot["id"].as_str().unwrap().starts_with("published-"));

    // without the cookie, the published release is served again
    let (_, snapshot) = get_json(&server, "/snapshot").await;
    assert_eq!(snapshot["id"], "published-1");

    // drafts are fetched on every request
    assert_eq!(mock.calls(Operation::GetSavedRelease), 2);
}

#[tokio::test]
async fn test_scheduled_selection() {
    latestrev_test::setup();

    let mock = Arc::new(MockSource::new());
    mock.publish_collection(ReleaseVersion(1), "posts", 1);
    mock.add_scheduled("launch", draft(json!({"posts": {"item-0": 1}})));
    let server = serve(&mock);

    let (status, items) = get_json(&server, "/collections/posts/items?cms=launch").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items, json!([{"id": "item-0"}]));

    let (status, error) = get_json(&server, "/snapshot?cms=unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["detail"], "release not found");

    mock.fail(
        Operation::GetScheduledRelease,
        CacheError::Timeout(Duration::from_secs(1)),
    );
    let (status, _) = get_json(&server, "/snapshot?cms=launch").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_refresh() {
    latestrev_test::setup();

    let mock = Arc::new(MockSource::new());
    mock.publish_collection(ReleaseVersion(1), "posts", 1);
    let server = serve(&mock);
    let client = Client::new();

    let response = client.post(server.url("/refresh")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[EXPIRES], "-1");
    assert_eq!(response.json::<Value>().await.unwrap(), json!("published-1"));

    mock.publish_collection(ReleaseVersion(2), "posts", 1);
    let response = client.get(server.url("/refresh")).send().await.unwrap();
    assert_eq!(response.json::<Value>().await.unwrap(), json!("published-2"));

    let (_, snapshot) = get_json(&server, "/snapshot").await;
    assert_eq!(snapshot["id"], "published-2");

    mock.fail(
        Operation::GetPublishedReleaseVersion,
        CacheError::DownloadError("503 Service Unavailable".into()),
    );
    let response = client.post(server.url("/refresh")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["detail"], "failed to refresh the published release");
    assert_eq!(
        error["causes"],
        json!(["download failed: 503 Service Unavailable"])
    );
}

#[tokio::test]
async fn test_localized_strings() {
    latestrev_test::setup();

    let mock = Arc::new(MockSource::new());
    mock.publish(
        serde_json::from_value(json!({
            "version": 1,
            "collections": {"strings": {"title": 1, "subtitle": 1}}
        }))
        .unwrap(),
    );
    mock.add_item(
        "strings",
        "title",
        ItemVersion::from(1),
        json!({"source": "Welcome", "de": {"selected": "Willkommen"}}),
    );
    mock.add_item(
        "strings",
        "subtitle",
        ItemVersion::from(1),
        json!({"source": "Enjoy"}),
    );
    let server = serve(&mock);

    let (status, strings) = get_json(&server, "/collections/strings/strings/de").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(strings, json!({"subtitle": "Enjoy", "title": "Willkommen"}));

    let (_, strings) = get_json(
        &server,
        "/collections/strings/strings/de?fallback_to_source=false",
    )
    .await;
    assert_eq!(strings, json!({"subtitle": "subtitle", "title": "Willkommen"}));

    let (_, strings) = get_json(
        &server,
        "/collections/strings/strings/de?fallback_to_source=false&fallback_to_id=false",
    )
    .await;
    assert_eq!(strings, json!({"title": "Willkommen"}));
}

#[tokio::test]
async fn test_full_source_chain() {
    latestrev_test::setup();

    let api = ContentApi::new();
    api.publish(json!({
        "version": 12,
        "collections": {"posts": {"hello": 3}},
        "media": {"images": {"publicUrl": "https://cdn.example.com/"}}
    }));
    api.add_item("posts", "hello", 3, json!({"title": "Hello"}));
    api.set_saved(json!({"collections": {"posts": {"hello": 4}}}));
    api.add_item("posts", "hello", 4, json!({"title": "Hello, again"}));

    let cache_dir = latestrev_test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        project: Some(api.project_config()),
        ..Config::default()
    };
    let coordinator = ReleaseCoordinator::from_config(&config).unwrap();
    let server = Server::new(create_app(coordinator));

    let (_, snapshot) = get_json(&server, "/snapshot").await;
    assert_eq!(snapshot, json!({"id": "published-12", "version": 12}));

    let (_, items) = get_json(&server, "/collections/posts/items").await;
    assert_eq!(items, json!([{"title": "Hello"}]));

    let (_, item) = get_json(&server, "/collections/posts/items/hello?cms=saved").await;
    assert_eq!(item, json!({"title": "Hello, again"}));

    assert!(cache_dir.path().join("published/12.json").is_file());
    assert!(cache_dir.path().join("collections/posts/hello-3.json").is_file());
    assert!(cache_dir.path().join("collections/posts/hello-4.json").is_file());
}
