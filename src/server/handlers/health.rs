use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

/// Liveness probe: returns 200 OK if the server process is running.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "mode": state.service.mode().as_str()}))
}

/// Readiness probe: returns 200 OK when tile storage answers. Dev mode has
/// no storage and is always ready.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(store) = state.store.as_ref() else {
        return Ok(Json(json!({"status": "ready", "storage": null})));
    };
    match store.ping().await {
        Ok(()) => Ok(Json(
            json!({"status": "ready", "storage": store.backend(), "storage_connected": true}),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "storage": store.backend(),
                "storage_connected": false,
                "error": e.to_string(),
            })),
        )),
    }
}
