use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use tilejson::TileJSON;

use super::{error_body, ApiError};
use crate::server::AppState;

/// `GET /:tileset/tilejson.json`
pub async fn get_tilejson(
    State(state): State<AppState>,
    Path(tileset): Path<String>,
) -> Result<Json<TileJSON>, ApiError> {
    let tj = state.service.fetch_tilejson(&tileset, &state.base_url)?;
    Ok(Json(tj))
}

/// `GET /tilejson.json`: redirect to the only tileset, if there is exactly one.
pub async fn root_tilejson(State(state): State<AppState>) -> Response {
    match state.service.catalog().single() {
        Some(config) => Redirect::temporary(&format!("/{}/tilejson.json", config.id)).into_response(),
        None => error_body(
            StatusCode::NOT_FOUND,
            "more than one tileset is served; request /<tileset>/tilejson.json",
        ),
    }
}
