//! Serving modes.
//!
//! A process serves in exactly one mode, chosen at startup:
//! - `dev` generates every tile on request and never touches storage.
//! - `live` reads storage first, and on a miss generates, stores (best-effort)
//!   and returns the fresh tile.
//! - `static` only reads storage; a missing tile is not found.
//!
//! Concurrent misses for the same tile in `live` mode are not deduplicated.
//! Each request generates independently and the resulting puts overwrite each
//! other with identical content.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tilejson::TileJSON;
use tracing::{debug, instrument, warn};

use crate::error::{KilnError, Result};
use crate::generator::TileGenerator;
use crate::storage::TileStore;
use crate::tile::TileCoordinate;
use crate::tileset::TilesetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingMode {
    Dev,
    Live,
    Static,
}

impl ServingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingMode::Dev => "dev",
            ServingMode::Live => "live",
            ServingMode::Static => "static",
        }
    }
}

impl fmt::Display for ServingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServingMode {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(ServingMode::Dev),
            "live" => Ok(ServingMode::Live),
            "static" => Ok(ServingMode::Static),
            other => Err(KilnError::Config(format!("unknown serving mode: {other}"))),
        }
    }
}

/// Where a served tile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServedTile {
    pub payload: Bytes,
    /// `None` in dev mode, which has no cache.
    pub cache: Option<CacheStatus>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// The tilesets a process serves, keyed by id. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tilesets: BTreeMap<String, Arc<TilesetConfig>>,
}

impl Catalog {
    pub fn new(configs: impl IntoIterator<Item = TilesetConfig>) -> Result<Self> {
        let mut tilesets = BTreeMap::new();
        for config in configs {
            let id = config.id.clone();
            if tilesets.insert(id.clone(), Arc::new(config)).is_some() {
                return Err(KilnError::Config(format!(
                    "tileset id {id} is configured more than once"
                )));
            }
        }
        Ok(Self { tilesets })
    }

    pub fn get(&self, tileset_id: &str) -> Result<&Arc<TilesetConfig>> {
        self.tilesets
            .get(tileset_id)
            .ok_or_else(|| KilnError::TilesetNotFound {
                tileset: tileset_id.to_string(),
            })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tilesets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tilesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tilesets.is_empty()
    }

    /// The only tileset, when exactly one is served.
    pub fn single(&self) -> Option<&Arc<TilesetConfig>> {
        match self.tilesets.len() {
            1 => self.tilesets.values().next(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TilesetConfig>> {
        self.tilesets.values()
    }
}

/// What every serving mode answers.
#[async_trait]
pub trait TileService: Send + Sync {
    fn mode(&self) -> ServingMode;

    fn catalog(&self) -> &Catalog;

    /// `Ok(None)` means the tile is not available in this mode.
    async fn fetch_tile(
        &self,
        tileset_id: &str,
        coordinate: TileCoordinate,
    ) -> Result<Option<ServedTile>>;

    /// TileJSON built from config, independent of tile availability.
    fn fetch_tilejson(&self, tileset_id: &str, base_url: &str) -> Result<TileJSON> {
        Ok(self.catalog().get(tileset_id)?.tilejson(base_url))
    }
}

fn count_fetch(mode: ServingMode, result: &str) {
    crate::metrics::TILE_FETCHES_TOTAL
        .with_label_values(&[mode.as_str(), result])
        .inc();
}

/// The catalog already knows the tileset, so storage not knowing it is an
/// outage on the storage side, not a missing resource.
fn storage_lost(err: KilnError) -> KilnError {
    match err {
        KilnError::TilesetNotFound { tileset } => {
            KilnError::Storage(format!("tileset {tileset} is served but missing from storage"))
        }
        other => other,
    }
}

pub struct DevService {
    catalog: Catalog,
    generator: TileGenerator,
}

impl DevService {
    pub fn new(catalog: Catalog, generator: TileGenerator) -> Self {
        Self { catalog, generator }
    }
}

#[async_trait]
impl TileService for DevService {
    fn mode(&self) -> ServingMode {
        ServingMode::Dev
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn fetch_tile(
        &self,
        tileset_id: &str,
        coordinate: TileCoordinate,
    ) -> Result<Option<ServedTile>> {
        let config = self.catalog.get(tileset_id)?;
        let rendered = self.generator.generate(config, coordinate).await?;
        count_fetch(ServingMode::Dev, "generated");
        Ok(Some(ServedTile {
            payload: rendered.payload,
            cache: None,
            generated_at: Some(rendered.generated_at),
        }))
    }
}

pub struct LiveService {
    catalog: Catalog,
    generator: TileGenerator,
    store: Arc<dyn TileStore>,
}

impl LiveService {
    pub fn new(catalog: Catalog, generator: TileGenerator, store: Arc<dyn TileStore>) -> Self {
        Self {
            catalog,
            generator,
            store,
        }
    }
}

#[async_trait]
impl TileService for LiveService {
    fn mode(&self) -> ServingMode {
        ServingMode::Live
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[instrument(skip(self), fields(mode = "live"))]
    async fn fetch_tile(
        &self,
        tileset_id: &str,
        coordinate: TileCoordinate,
    ) -> Result<Option<ServedTile>> {
        let config = self.catalog.get(tileset_id)?;

        // Read failures other than "absent" propagate rather than regenerate.
        let stored = self
            .store
            .get(tileset_id, coordinate)
            .await
            .map_err(storage_lost)?;
        if let Some(stored) = stored {
            count_fetch(ServingMode::Live, "hit");
            return Ok(Some(ServedTile {
                payload: stored.payload,
                cache: Some(CacheStatus::Hit),
                generated_at: stored.generated_at,
            }));
        }

        let rendered = self.generator.generate(config, coordinate).await?;
        count_fetch(ServingMode::Live, "miss");
        if let Err(e) = self
            .store
            .put(tileset_id, coordinate, rendered.payload.clone())
            .await
        {
            warn!(error = %e, tile = %coordinate, "failed to store generated tile");
        } else {
            debug!(tile = %coordinate, "stored generated tile");
        }

        Ok(Some(ServedTile {
            payload: rendered.payload,
            cache: Some(CacheStatus::Miss),
            generated_at: Some(rendered.generated_at),
        }))
    }
}

pub struct StaticService {
    catalog: Catalog,
    store: Arc<dyn TileStore>,
}

impl StaticService {
    pub fn new(catalog: Catalog, store: Arc<dyn TileStore>) -> Self {
        Self { catalog, store }
    }
}

#[async_trait]
impl TileService for StaticService {
    fn mode(&self) -> ServingMode {
        ServingMode::Static
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn fetch_tile(
        &self,
        tileset_id: &str,
        coordinate: TileCoordinate,
    ) -> Result<Option<ServedTile>> {
        self.catalog.get(tileset_id)?;
        match self
            .store
            .get(tileset_id, coordinate)
            .await
            .map_err(storage_lost)?
        {
            Some(stored) => {
                count_fetch(ServingMode::Static, "hit");
                Ok(Some(ServedTile {
                    payload: stored.payload,
                    cache: Some(CacheStatus::Hit),
                    generated_at: stored.generated_at,
                }))
            }
            None => {
                count_fetch(ServingMode::Static, "not_found");
                Ok(None)
            }
        }
    }
}

/// Check every served tileset is registered in storage. Modes that read
/// storage refuse to start otherwise.
pub async fn ensure_registered(catalog: &Catalog, store: &dyn TileStore) -> Result<()> {
    for config in catalog.iter() {
        store.tileset_metadata(&config.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::StubSource;
    use crate::storage::ObjectTileStore;
    use crate::tileset::tests::config_from;
    use object_store::memory::InMemory;

    const YAML: &str = r#"
metadata: {id: osm, name: OSM}
vector_layers:
  water:
    sql:
      - {minzoom: 0, maxzoom: 8, extent: 2048, file: q.sql}
"#;

    fn catalog() -> Catalog {
        Catalog::new([config_from(YAML, &[("q.sql", "SELECT 1")]).unwrap()]).unwrap()
    }

    fn tile(z: u32, x: u32, y: u32) -> TileCoordinate {
        TileCoordinate::new(z, x, y).unwrap()
    }

    async fn store() -> Arc<dyn TileStore> {
        let store = ObjectTileStore::new(Arc::new(InMemory::new()));
        for config in catalog().iter() {
            store.init_tileset(config).await.unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_dev_always_generates() {
        let source = Arc::new(StubSource::default());
        let service = DevService::new(catalog(), TileGenerator::new(source.clone(), None));
        for _ in 0..2 {
            let served = service.fetch_tile("osm", tile(2, 1, 1)).await.unwrap().unwrap();
            assert_eq!(&served.payload[..], b"<water>");
            assert_eq!(served.cache, None);
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_live_generates_once_then_serves_stored() {
        let source = Arc::new(StubSource::default());
        let store = store().await;
        let service = LiveService::new(
            catalog(),
            TileGenerator::new(source.clone(), None),
            store.clone(),
        );

        let first = service.fetch_tile("osm", tile(3, 2, 1)).await.unwrap().unwrap();
        assert_eq!(first.cache, Some(CacheStatus::Miss));
        assert_eq!(source.calls(), 1);
        assert!(store.exists("osm", tile(3, 2, 1)).await.unwrap());

        let second = service.fetch_tile("osm", tile(3, 2, 1)).await.unwrap().unwrap();
        assert_eq!(second.cache, Some(CacheStatus::Hit));
        assert_eq!(second.payload, first.payload);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_live_put_failure_still_serves() {
        // Reads pass through, every put fails.
        struct ReadOnly(Arc<dyn TileStore>);

        #[async_trait]
        impl TileStore for ReadOnly {
            fn backend(&self) -> &'static str {
                "read-only"
            }
            async fn init_tileset(&self, c: &TilesetConfig) -> Result<()> {
                self.0.init_tileset(c).await
            }
            async fn destroy_tileset(&self, id: &str) -> Result<()> {
                self.0.destroy_tileset(id).await
            }
            async fn tileset_ids(&self) -> Result<Vec<String>> {
                self.0.tileset_ids().await
            }
            async fn tileset_metadata(&self, id: &str) -> Result<crate::storage::TilesetMetadata> {
                self.0.tileset_metadata(id).await
            }
            async fn zoom_stats(&self, id: &str) -> Result<Vec<crate::storage::ZoomStats>> {
                self.0.zoom_stats(id).await
            }
            async fn put(&self, _: &str, _: TileCoordinate, _: Bytes) -> Result<()> {
                Err(KilnError::Storage("read-only".into()))
            }
            async fn get(
                &self,
                id: &str,
                c: TileCoordinate,
            ) -> Result<Option<crate::storage::StoredTile>> {
                self.0.get(id, c).await
            }
            async fn exists(&self, id: &str, c: TileCoordinate) -> Result<bool> {
                self.0.exists(id, c).await
            }
            async fn delete(&self, id: &str, c: TileCoordinate) -> Result<()> {
                self.0.delete(id, c).await
            }
            async fn delete_zoom(&self, id: &str, s: crate::storage::ZoomScope) -> Result<u64> {
                self.0.delete_zoom(id, s).await
            }
            async fn ping(&self) -> Result<()> {
                Ok(())
            }
        }

        let source = Arc::new(StubSource::default());
        let store: Arc<dyn TileStore> = Arc::new(ReadOnly(store().await));
        let service = LiveService::new(catalog(), TileGenerator::new(source.clone(), None), store);

        for _ in 0..2 {
            let served = service.fetch_tile("osm", tile(1, 0, 0)).await.unwrap().unwrap();
            assert_eq!(served.cache, Some(CacheStatus::Miss));
            assert_eq!(&served.payload[..], b"<water>");
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_live_read_error_is_not_a_miss() {
        let source = Arc::new(StubSource::default());
        // Served tileset that storage has never heard of.
        let store: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(Arc::new(InMemory::new())));
        let service = LiveService::new(catalog(), TileGenerator::new(source.clone(), None), store);
        let err = service.fetch_tile("osm", tile(1, 0, 0)).await.unwrap_err();
        assert!(matches!(err, KilnError::Storage(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_static_tileset_lost_from_storage_is_server_error() {
        let store = store().await;
        let service = StaticService::new(catalog(), store.clone());
        store
            .put("osm", tile(2, 0, 0), Bytes::from_static(b"stored"))
            .await
            .unwrap();
        store.destroy_tileset("osm").await.unwrap();

        let err = service.fetch_tile("osm", tile(2, 0, 0)).await.unwrap_err();
        assert!(err.to_string().contains("missing from storage"), "{err}");
        assert_eq!(err.status_code(), 500);

        // A tileset outside the catalog is still a plain 404.
        let err = service.fetch_tile("nope", tile(2, 0, 0)).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_static_missing_tile_is_not_found() {
        let store = store().await;
        let service = StaticService::new(catalog(), store.clone());
        assert!(service.fetch_tile("osm", tile(4, 3, 3)).await.unwrap().is_none());

        store
            .put("osm", tile(4, 3, 3), Bytes::from_static(b"stored"))
            .await
            .unwrap();
        let served = service.fetch_tile("osm", tile(4, 3, 3)).await.unwrap().unwrap();
        assert_eq!(&served.payload[..], b"stored");
    }

    #[tokio::test]
    async fn test_unknown_tileset() {
        let source = Arc::new(StubSource::default());
        let service = DevService::new(catalog(), TileGenerator::new(source, None));
        let err = service.fetch_tile("nope", tile(0, 0, 0)).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(service.fetch_tilejson("nope", "http://x").is_err());
    }

    #[tokio::test]
    async fn test_tilejson_is_independent_of_tiles() {
        let service = StaticService::new(catalog(), store().await);
        let tj = service.fetch_tilejson("osm", "http://tiles.test").unwrap();
        assert_eq!(tj.name.as_deref(), Some("OSM"));
        assert_eq!(tj.tiles, vec!["http://tiles.test/osm/{z}/{x}/{y}.mvt".to_string()]);
    }

    #[test]
    fn test_catalog() {
        let c = catalog();
        assert_eq!(c.len(), 1);
        assert!(c.single().is_some());
        assert_eq!(c.ids().collect::<Vec<_>>(), vec!["osm"]);

        let dup = config_from(YAML, &[("q.sql", "SELECT 1")]).unwrap();
        assert!(Catalog::new([dup.clone(), dup]).is_err());
        assert!(Catalog::default().single().is_none());
    }

    #[tokio::test]
    async fn test_ensure_registered() {
        let empty = ObjectTileStore::new(Arc::new(InMemory::new()));
        assert!(ensure_registered(&catalog(), &empty).await.is_err());
        let ready = store().await;
        ensure_registered(&catalog(), ready.as_ref()).await.unwrap();
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("live".parse::<ServingMode>().unwrap(), ServingMode::Live);
        assert!("cached".parse::<ServingMode>().is_err());
        assert_eq!(ServingMode::Static.to_string(), "static");
    }
}
