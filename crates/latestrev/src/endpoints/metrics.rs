use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;

use latestrev_service::metric;

/// Records the duration and status of every request, tagged with the matched route.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let response = next.run(request).await;

    metric!(timer("requests.duration") = start.elapsed(), "route" => &route);
    metric!(
        counter("responses.status_code") += 1,
        "status" => response.status().as_str(),
        "route" => &route,
    );
    response
}
