use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use uuid::Uuid;

use tilekiln::error::{KilnError, Result};
use tilekiln::generator::{SourceDatabase, TileGenerator};
use tilekiln::storage::{ObjectTileStore, PgTileStore, TileStore};
use tilekiln::tileset::TilesetConfig;

/// Source database stand-in. Answers each layer query with `<layer>` so a
/// payload shows which layers were generated, in order.
#[derive(Default)]
pub struct StubSource {
    pub calls: AtomicUsize,
    pub empty: HashSet<String>,
    pub failing: HashSet<String>,
}

impl StubSource {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn layer_of(sql: &str) -> String {
    let marker = "ST_AsMVT(mvtgeom.*, '";
    let start = sql.find(marker).map(|i| i + marker.len()).unwrap_or(0);
    let end = sql[start..].find('\'').map_or(sql.len(), |e| start + e);
    sql[start..end].to_string()
}

#[async_trait]
impl SourceDatabase for StubSource {
    async fn query_layer(&self, sql: &str) -> Result<Option<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let layer = layer_of(sql);
        if self.failing.contains(&layer) {
            return Err(KilnError::Storage(format!("relation {layer} does not exist")));
        }
        if self.empty.contains(&layer) {
            return Ok(None);
        }
        Ok(Some(Bytes::from(format!("<{layer}>"))))
    }
}

pub const BASIC_TILESET: &str = r#"
metadata:
  id: {id}
  name: Test tiles
  attribution: test data
  bounds: [-180, -85.05112877980659, 180, 85.0511287798066]
  center: [0, 0, 2]
vector_layers:
  water:
    description: Water polygons
    fields:
      name: Water body name
    sql:
      - {minzoom: 0, maxzoom: 8, file: water.sql.jinja2}
  roads:
    sql:
      - {minzoom: 4, maxzoom: 10, extent: 1024, buffer: 8, file: roads.sql.jinja2}
"#;

/// Tileset files on disk plus the stub source and an isolated store.
pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub source: Arc<StubSource>,
    pub store: Arc<dyn TileStore>,
    /// Random suffix keeping tileset ids unique across tests sharing a database.
    pub prefix: String,
    created: std::sync::Mutex<Vec<String>>,
}

impl TestHarness {
    /// Harness with in-memory storage.
    pub fn new() -> Self {
        Self::with_source(StubSource::default())
    }

    pub fn with_source(source: StubSource) -> Self {
        let store: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(Arc::new(InMemory::new())));
        Self::build(source, store)
    }

    /// Storage selected by `TEST_BACKEND`: `memory` (default), `local`, or
    /// `postgres`. Returns `None` when the backend needs a database and
    /// `TILEKILN_TEST_DATABASE_URL` is unset.
    pub async fn from_env() -> Option<Self> {
        // Load .env file if present (ignore errors, CI may use real env vars)
        let _ = dotenvy::dotenv();

        let backend = std::env::var("TEST_BACKEND").unwrap_or_else(|_| "memory".to_string());
        match backend.as_str() {
            "memory" => Some(Self::new()),
            "local" => {
                let root = tempfile::tempdir().unwrap();
                let fs = object_store::local::LocalFileSystem::new_with_prefix(root.path()).unwrap();
                let store: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(Arc::new(fs)));
                // The root must outlive the store; tests are short-lived processes.
                std::mem::forget(root);
                Some(Self::build(StubSource::default(), store))
            }
            "postgres" => {
                let url = std::env::var("TILEKILN_TEST_DATABASE_URL").ok()?;
                let store = PgTileStore::connect(&url, 4)
                    .await
                    .expect("failed to connect to test database");
                Some(Self::build(StubSource::default(), Arc::new(store)))
            }
            other => panic!("unsupported TEST_BACKEND: {other}"),
        }
    }

    fn build(source: StubSource, store: Arc<dyn TileStore>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("water.sql.jinja2"),
            "SELECT ST_AsMVTGeom(way, {{ unbuffered_bbox }}, {{ extent }}, {{ buffer }}) AS way\nFROM water\nWHERE way && {{ bbox }} AND {{ zoom }} >= 0",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("roads.sql.jinja2"),
            "SELECT ST_AsMVTGeom(way, {{ unbuffered_bbox }}, {{ extent }}, {{ buffer }}) AS way\nFROM roads\nWHERE way && {{ bbox }}\n  AND ST_Length(way) > {{ coordinate_length }}",
        )
        .unwrap();
        let prefix = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            dir,
            source: Arc::new(source),
            store,
            prefix,
            created: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A tileset id unique to this harness.
    pub fn id(&self, suffix: &str) -> String {
        format!("{suffix}_{}", self.prefix)
    }

    /// Write `yaml` (with `{id}` replaced) next to the query files.
    pub fn write_tileset(&self, id: &str, yaml: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{id}.yaml"));
        std::fs::write(&path, yaml.replace("{id}", id)).unwrap();
        path
    }

    pub fn tileset(&self, id: &str) -> TilesetConfig {
        TilesetConfig::load(self.write_tileset(id, BASIC_TILESET)).unwrap()
    }

    /// Load the basic tileset under `id` and register it with the store.
    pub async fn init_tileset(&self, id: &str) -> TilesetConfig {
        let config = self.tileset(id);
        self.store.init_tileset(&config).await.unwrap();
        self.created.lock().unwrap().push(id.to_string());
        config
    }

    pub fn generator(&self) -> TileGenerator {
        TileGenerator::new(self.source.clone(), None)
    }

    /// Destroy every tileset this harness registered.
    pub async fn cleanup(&self) {
        let ids = std::mem::take(&mut *self.created.lock().unwrap());
        for id in ids {
            if let Err(e) = self.store.destroy_tileset(&id).await {
                eprintln!("[test harness] warning: cleanup of {id} failed: {e}");
            }
        }
    }
}
