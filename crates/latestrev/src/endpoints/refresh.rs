use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use latestrev_service::coordinator::ReleaseCoordinator;

use super::ResponseError;

/// Checks for a new published release and responds with the id of the current snapshot.
pub async fn refresh_published(
    State(coordinator): State<ReleaseCoordinator>,
) -> Result<impl IntoResponse, ResponseError> {
    let snapshot = coordinator.refresh_published().await.map_err(|err| {
        let err = anyhow::Error::new(err).context("failed to refresh the published release");
        ResponseError::from((StatusCode::INTERNAL_SERVER_ERROR, err))
    })?;

    Ok(([(header::EXPIRES, "-1")], Json(snapshot.id().to_owned())))
}
