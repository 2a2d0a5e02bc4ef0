use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{error_body, health, metrics, tilejson, tiles};
use super::middleware;
use super::AppState;

/// Builds the axum router with all routes, middleware, and shared state.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    // Probes and metrics skip the request-id span and trace layer.
    let ops_routes = Router::new()
        .route("/healthz", get(health::health_check))
        .route("/readyz", get(health::readiness_check))
        .route("/metrics", get(metrics::metrics_handler));

    // `get` also answers HEAD, with the body stripped.
    let tile_routes = Router::new()
        .route("/tilejson.json", get(tilejson::root_tilejson))
        .route("/:tileset/tilejson.json", get(tilejson::get_tilejson))
        .route("/:tileset/:zoom/:x/:y_mvt", get(tiles::get_tile))
        // Segment names must match the scoped routes; the handler reads them as z/x/y.
        .route("/:tileset/:zoom/:x", get(tiles::get_default_tile))
        .fallback(|| async { error_body(axum::http::StatusCode::NOT_FOUND, "not found") })
        .layer(axum::middleware::from_fn(middleware::http_metrics))
        .layer(TimeoutLayer::new(timeout))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(middleware::request_id));

    ops_routes.merge(tile_routes).with_state(state)
}
