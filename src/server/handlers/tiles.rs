use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::instrument;

use super::{error_body, ApiError};
use crate::error::KilnError;
use crate::server::AppState;
use crate::serving::ServingMode;
use crate::tile::TileCoordinate;

pub const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";
pub const CACHE_STATUS_HEADER: &str = "x-tilekiln-cache";

/// `GET|HEAD /:tileset/:zoom/:x/:y.mvt`
#[instrument(skip(state))]
pub async fn get_tile(
    State(state): State<AppState>,
    Path((tileset, zoom, x, y_mvt)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let Some(y) = y_mvt.strip_suffix(".mvt") else {
        return Ok(error_body(StatusCode::NOT_FOUND, "not found"));
    };
    let coordinate = parse_coordinate(&zoom, &x, y)?;
    serve_tile(&state, &tileset, coordinate).await
}

/// `GET|HEAD /:zoom/:x/:y.mvt`, answered from the only served tileset.
#[instrument(skip(state))]
pub async fn get_default_tile(
    State(state): State<AppState>,
    Path((zoom, x, y_mvt)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let Some(y) = y_mvt.strip_suffix(".mvt") else {
        return Ok(error_body(StatusCode::NOT_FOUND, "not found"));
    };
    let coordinate = parse_coordinate(&zoom, &x, y)?;
    let Some(config) = state.service.catalog().single() else {
        return Ok(error_body(
            StatusCode::NOT_FOUND,
            "more than one tileset is served; request /<tileset>/<z>/<x>/<y>.mvt",
        ));
    };
    let tileset = config.id.clone();
    serve_tile(&state, &tileset, coordinate).await
}

async fn serve_tile(
    state: &AppState,
    tileset: &str,
    coordinate: TileCoordinate,
) -> Result<Response, ApiError> {
    let Some(tile) = state.service.fetch_tile(tileset, coordinate).await? else {
        return Ok(error_body(
            StatusCode::NOT_FOUND,
            format!("tile {tileset}/{coordinate} not found"),
        ));
    };

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, MVT_CONTENT_TYPE)],
        tile.payload,
    )
        .into_response();
    let headers = response.headers_mut();
    if state.service.mode() == ServingMode::Dev {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    if let Some(cache) = tile.cache {
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache.as_str()));
    }
    if let Some(generated_at) = tile.generated_at {
        let formatted = generated_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    Ok(response)
}

fn parse_coordinate(zoom: &str, x: &str, y: &str) -> Result<TileCoordinate, KilnError> {
    let parse = |part: &str| {
        part.parse::<u32>().map_err(|_| {
            KilnError::Validation(format!("invalid tile address {zoom}/{x}/{y}"))
        })
    };
    TileCoordinate::new(parse(zoom)?, parse(x)?, parse(y)?)
}
