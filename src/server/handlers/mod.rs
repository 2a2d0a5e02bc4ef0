/// Health and readiness probe handlers.
pub mod health;
/// Prometheus metrics exposition handler.
pub mod metrics;
/// TileJSON handlers.
pub mod tilejson;
/// Tile fetch handler.
pub mod tiles;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::KilnError;

/// Wrapper that converts `KilnError` into an HTTP response.
pub struct ApiError(pub KilnError);

impl From<KilnError> for ApiError {
    fn from(e: KilnError) -> Self {
        ApiError(e)
    }
}

/// Maps `ApiError` to an HTTP response with a JSON body and appropriate status code.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status_code.is_server_error() {
            tracing::error!(error = %self.0, status, "server error");
        } else if status_code.is_client_error() {
            tracing::warn!(error = %self.0, status, "client error");
        }
        error_body(status_code, self.0.to_string())
    }
}

/// JSON error body shared by `ApiError` and plain not-found responses.
pub(crate) fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "error": message.into(),
        "status": status.as_u16(),
    });
    (status, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status() {
        let response = ApiError(KilnError::TilesetNotFound {
            tileset: "osm".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(KilnError::Generation {
            layer: "water".into(),
            cause: "boom".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
