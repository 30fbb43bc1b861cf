use axum::Json;
use axum::extract::{Path, Query};
use serde::{Deserialize, Serialize};

use latestrev_service::snapshot::{CollectionItems, LocalizedLookup};
use latestrev_sources::{Item, ReleaseVersion};

use super::ResponseError;
use super::selection::SelectedSnapshot;

#[derive(Debug, Serialize)]
pub struct SnapshotInfo {
    id: String,
    version: Option<ReleaseVersion>,
}

pub async fn get_snapshot(SelectedSnapshot(snapshot): SelectedSnapshot) -> Json<SnapshotInfo> {
    Json(SnapshotInfo {
        id: snapshot.id().to_owned(),
        version: snapshot.version(),
    })
}

pub async fn get_items(
    SelectedSnapshot(snapshot): SelectedSnapshot,
    Path(collection_id): Path<String>,
) -> Result<Json<CollectionItems>, ResponseError> {
    let items = snapshot.get_items(&collection_id).await?;
    Ok(Json(items))
}

pub async fn get_item(
    SelectedSnapshot(snapshot): SelectedSnapshot,
    Path((collection_id, item_id)): Path<(String, String)>,
) -> Result<Json<Item>, ResponseError> {
    match snapshot.get_item(&collection_id, &item_id).await? {
        Some(item) => Ok(Json(Item::clone(&item))),
        None => Err(ResponseError::not_found("item not found")),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct StringsQuery {
    #[serde(default = "default_true")]
    fallback_to_source: bool,
    #[serde(default = "default_true")]
    fallback_to_id: bool,
}

pub async fn get_strings(
    SelectedSnapshot(snapshot): SelectedSnapshot,
    Path((collection_id, locale)): Path<(String, String)>,
    Query(query): Query<StringsQuery>,
) -> Result<Json<LocalizedLookup>, ResponseError> {
    let lookup = snapshot
        .get_localized_lookup(
            &collection_id,
            &locale,
            query.fallback_to_source,
            query.fallback_to_id,
        )
        .await?;
    Ok(Json(lookup))
}
