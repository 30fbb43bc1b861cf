use axum::Router;
use axum::middleware;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use latestrev_service::coordinator::ReleaseCoordinator;
use latestrev_service::metric;

mod content;
mod error;
mod metrics;
mod refresh;
mod selection;

#[cfg(test)]
mod tests;

pub use error::ResponseError;

use content::{get_item, get_items, get_snapshot, get_strings};
use refresh::refresh_published;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(coordinator: ReleaseCoordinator) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(metrics::track_requests))
        .layer(middleware::from_fn(selection::remember_selection));

    Router::new()
        .route("/refresh", get(refresh_published).post(refresh_published))
        .route("/snapshot", get(get_snapshot))
        .route("/collections/:collection/items", get(get_items))
        .route("/collections/:collection/items/:item", get(get_item))
        .route("/collections/:collection/strings/:locale", get(get_strings))
        .with_state(coordinator)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
