//! Per-request selection of the snapshot to serve.
//!
//! Requests are served from the published snapshot unless they ask for a draft: `?cms=saved`
//! selects the saved working copy and remembers that choice in a `cms` cookie, `?cms=<id>`
//! selects a scheduled release.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Query, Request};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use latestrev_service::coordinator::ReleaseCoordinator;
use latestrev_service::snapshot::Snapshot;

use super::ResponseError;

const SAVED: &str = "saved";

#[derive(Debug, Deserialize)]
struct SelectionQuery {
    cms: Option<String>,
}

/// Which release a request is served from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Published,
    Saved,
    Scheduled(String),
}

impl Selection {
    /// Reads the selection from the `cms` query parameter, falling back to the `cms` cookie.
    fn from_request(uri: &Uri, headers: &HeaderMap) -> Self {
        match queried_release(uri) {
            Some(id) if id == SAVED => Self::Saved,
            Some(id) => Self::Scheduled(id),
            None if cookie(headers, "cms") == Some(SAVED) => Self::Saved,
            None => Self::Published,
        }
    }
}

fn queried_release(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<SelectionQuery>::try_from_uri(uri).ok()?;
    query.cms.filter(|id| !id.is_empty())
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find_map(|(key, value)| (key == name).then_some(value))
}

/// Sets the `cms` cookie when the saved working copy is selected through the query.
pub async fn remember_selection(request: Request, next: Next) -> Response {
    let select_saved = queried_release(request.uri()).as_deref() == Some(SAVED);

    let mut response = next.run(request).await;
    if select_saved {
        response
            .headers_mut()
            .append(SET_COOKIE, HeaderValue::from_static("cms=saved; Path=/"));
    }
    response
}

/// Extracts the snapshot selected by the request.
///
/// The snapshot is only resolved by handlers that ask for it.
#[derive(Debug)]
pub struct SelectedSnapshot(pub Arc<Snapshot>);

#[async_trait]
impl FromRequestParts<ReleaseCoordinator> for SelectedSnapshot {
    type Rejection = ResponseError;

    async fn from_request_parts(
        parts: &mut Parts,
        coordinator: &ReleaseCoordinator,
    ) -> Result<Self, Self::Rejection> {
        let selection = Selection::from_request(&parts.uri, &parts.headers);
        tracing::trace!(?selection, "Resolving snapshot");

        let snapshot = match &selection {
            Selection::Published => coordinator.get_published(None).await?,
            Selection::Saved => coordinator.get_saved().await?,
            Selection::Scheduled(scheduled_id) => coordinator.get_scheduled(scheduled_id).await?,
        };

        snapshot
            .map(Self)
            .ok_or_else(|| ResponseError::not_found("release not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(uri: &str, cookie: Option<&str>) -> Selection {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie {
            headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        Selection::from_request(&uri.parse().unwrap(), &headers)
    }

    #[test]
    fn test_selection() {
        assert_eq!(selection("/snapshot", None), Selection::Published);
        assert_eq!(selection("/snapshot?cms=", None), Selection::Published);
        assert_eq!(selection("/snapshot?cms=saved", None), Selection::Saved);
        assert_eq!(
            selection("/snapshot?cms=spring-launch&x=1", None),
            Selection::Scheduled("spring-launch".into())
        );

        assert_eq!(
            selection("/snapshot", Some("theme=dark; cms=saved")),
            Selection::Saved
        );
        assert_eq!(
            selection("/snapshot", Some("cms=published")),
            Selection::Published
        );
        // the query wins over the cookie
        assert_eq!(
            selection("/snapshot?cms=next", Some("cms=saved")),
            Selection::Scheduled("next".into())
        );
    }
}
