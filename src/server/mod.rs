pub mod handlers;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::serving::TileService;
use crate::storage::TileStore;

/// Shared application state injected into all handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn TileService>,
    /// Present in modes that read storage; probed by `/readyz`.
    pub store: Option<Arc<dyn TileStore>>,
    pub config: Arc<Config>,
    /// Prefix for tile URLs in TileJSON responses.
    pub base_url: String,
}
