use tokio::net::TcpListener;

use super::harness::{TestHarness, BASIC_TILESET};

use tilekiln::config::Config;
use tilekiln::serving::{
    ensure_registered, Catalog, DevService, LiveService, ServingMode, StaticService, TileService,
};
use tilekiln::startup::build_app;
use std::sync::Arc;

/// Start a server in `mode` over the given tilesets, returning its base URL.
///
/// Each `(id, yaml)` is written into the harness directory. Live and static
/// modes register the tilesets with the harness store first.
pub async fn start_test_server_with(
    harness: &TestHarness,
    mode: ServingMode,
    tilesets: &[(&str, &str)],
) -> String {
    let configs = tilesets
        .iter()
        .map(|(id, yaml)| {
            tilekiln::tileset::TilesetConfig::load(harness.write_tileset(id, yaml)).unwrap()
        })
        .collect::<Vec<_>>();
    let catalog = Catalog::new(configs.clone()).unwrap();

    let service: Arc<dyn TileService> = match mode {
        ServingMode::Dev => Arc::new(DevService::new(catalog, harness.generator())),
        ServingMode::Live | ServingMode::Static => {
            for config in &configs {
                harness.store.init_tileset(config).await.unwrap();
            }
            ensure_registered(&catalog, harness.store.as_ref())
                .await
                .unwrap();
            if mode == ServingMode::Live {
                Arc::new(LiveService::new(catalog, harness.generator(), harness.store.clone()))
            } else {
                Arc::new(StaticService::new(catalog, harness.store.clone()))
            }
        }
    };
    let store = (mode != ServingMode::Dev).then(|| harness.store.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let mut config = Config::default();
    config.server.base_url = Some(base_url.clone());
    let app = build_app(config, service, store);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    base_url
}

/// Start a server in `mode` serving the basic tileset as `osm`.
pub async fn start_test_server(mode: ServingMode) -> (String, TestHarness) {
    let harness = TestHarness::new();
    let url = start_test_server_with(&harness, mode, &[("osm", BASIC_TILESET)]).await;
    (url, harness)
}
