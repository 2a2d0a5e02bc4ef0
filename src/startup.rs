//! Application startup and bootstrap logic.
//!
//! Kept out of `main.rs` so it can be exercised by tests with in-memory
//! storage and a stub source database.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{KilnError, Result};
use crate::generator::{PgSource, TileGenerator};
use crate::server::routes::build_router;
use crate::server::AppState;
use crate::serving::{
    ensure_registered, Catalog, DevService, LiveService, ServingMode, StaticService, TileService,
};
use crate::storage::{self, TileStore};
use crate::tileset::TilesetConfig;

/// Resolve the configuration file path.
///
/// Priority:
/// 1. `TILEKILN_CONFIG` environment variable
/// 2. `./tilekiln.toml` if it exists
/// 3. None (use defaults)
pub fn resolve_config_path() -> Option<String> {
    std::env::var("TILEKILN_CONFIG").ok().or_else(|| {
        let default = "tilekiln.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Initialize tracing subscriber from logging config.
///
/// Supports JSON and plain text formats. Uses `RUST_LOG` env var if set,
/// otherwise falls back to `config.logging.level`. Logs go to stderr so
/// command output on stdout stays clean.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Load and validate every tileset file. Any invalid file stops startup.
pub fn load_catalog<P: AsRef<Path>>(paths: &[P]) -> Result<Catalog> {
    if paths.is_empty() {
        return Err(KilnError::Config("no tileset config given".to_string()));
    }
    let configs = paths
        .iter()
        .map(TilesetConfig::load)
        .collect::<Result<Vec<_>>>()?;
    Catalog::new(configs)
}

/// Connect to the source database and wrap it in a generator.
pub async fn connect_generator(config: &Config) -> Result<TileGenerator> {
    let source = PgSource::connect(&config.source).await?;
    Ok(TileGenerator::with_timeout_ms(
        Arc::new(source),
        config.source.query_timeout_ms,
    ))
}

/// Build the tile service for `mode`, connecting only what the mode uses.
pub async fn build_service(
    config: &Config,
    mode: ServingMode,
    catalog: Catalog,
) -> Result<(Arc<dyn TileService>, Option<Arc<dyn TileStore>>)> {
    let built: (Arc<dyn TileService>, Option<Arc<dyn TileStore>>) = match mode {
        ServingMode::Dev => {
            let generator = connect_generator(config).await?;
            (Arc::new(DevService::new(catalog, generator)), None)
        }
        ServingMode::Live => {
            let store = storage::connect(config).await?;
            ensure_registered(&catalog, store.as_ref()).await?;
            let generator = connect_generator(config).await?;
            (
                Arc::new(LiveService::new(catalog, generator, store.clone())),
                Some(store),
            )
        }
        ServingMode::Static => {
            let store = storage::connect(config).await?;
            ensure_registered(&catalog, store.as_ref()).await?;
            (
                Arc::new(StaticService::new(catalog, store.clone())),
                Some(store),
            )
        }
    };
    Ok(built)
}

/// Assemble the router around an already-built service.
pub fn build_app(
    config: Config,
    service: Arc<dyn TileService>,
    store: Option<Arc<dyn TileStore>>,
) -> Router {
    crate::metrics::init();

    let base_url = config.server.public_url();
    tracing::info!(
        mode = %service.mode(),
        tilesets = ?service.catalog().ids().collect::<Vec<_>>(),
        base_url = %base_url,
        "tilekiln app ready"
    );

    let state = AppState {
        service,
        store,
        config: Arc::new(config),
        base_url,
    };
    build_router(state)
}
