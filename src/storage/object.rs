use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::{debug, info, instrument};

use super::{observe, record_error, StoredTile, TileStore, TilesetMetadata, ZoomScope, ZoomStats};
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{KilnError, Result};
use crate::tile::TileCoordinate;
use crate::tileset::TilesetConfig;

const BACKEND: &str = "object";
const DELETE_CONCURRENCY: usize = 32;

/// Tile store on top of `object_store`: S3, a local directory, or memory.
///
/// Layout: `<id>/metadata.json` registers a tileset, tiles live at
/// `<id>/tiles/<z>/<x>/<y>.mvt`.
#[derive(Clone)]
pub struct ObjectTileStore {
    inner: Arc<dyn ObjectStore>,
    /// Tilesets whose metadata has been seen, so tile reads skip the lookup.
    registered: Arc<DashMap<String, TilesetMetadata>>,
}

impl ObjectTileStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::S3 => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);

                if let Some(ref region) = config.s3_region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.s3_endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(ref key_id) = config.s3_access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(ref secret) = config.s3_secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if config.s3_allow_http {
                    builder = builder.with_allow_http(true);
                }

                // Needed for create-if-absent on metadata.json.
                builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);

                let client_options = ClientOptions::new()
                    .with_pool_max_idle_per_host(64)
                    .with_timeout(std::time::Duration::from_secs(30))
                    .with_connect_timeout(std::time::Duration::from_secs(10));
                builder = builder.with_client_options(client_options);

                Arc::new(builder.build().map_err(|e| {
                    KilnError::Config(format!("failed to build S3 store: {e}"))
                })?)
            }
            StorageBackend::Local => {
                let path = std::path::Path::new(&config.bucket);
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path).map_err(|e| {
                        KilnError::Config(format!("failed to build local store: {e}"))
                    })?,
                )
            }
            StorageBackend::Memory => Arc::new(object_store::memory::InMemory::new()),
            StorageBackend::Postgres => {
                return Err(KilnError::Config(
                    "postgres is not an object store backend".to_string(),
                ));
            }
        };
        info!(backend = %config.backend, bucket = %config.bucket, "object tile store configured");
        Ok(Self::new(store))
    }

    /// Create a store directly from an ObjectStore instance (for testing).
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: store,
            registered: Arc::new(DashMap::new()),
        }
    }

    fn metadata_key(tileset_id: &str) -> String {
        format!("{tileset_id}/metadata.json")
    }

    fn tile_key(tileset_id: &str, c: TileCoordinate) -> String {
        format!("{tileset_id}/tiles/{}/{}/{}.mvt", c.zoom(), c.x(), c.y())
    }

    fn tiles_prefix(tileset_id: &str, scope: ZoomScope) -> String {
        match scope {
            ZoomScope::All => format!("{tileset_id}/tiles"),
            ZoomScope::Zoom(z) => format!("{tileset_id}/tiles/{z}"),
        }
    }

    async fn read_metadata(&self, tileset_id: &str) -> Result<Option<TilesetMetadata>> {
        let path = Path::parse(Self::metadata_key(tileset_id))?;
        match self.inner.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => {
                record_error(BACKEND, "read_metadata");
                Err(e.into())
            }
        }
    }

    /// Fail with `TilesetNotFound` unless the tileset has metadata.
    async fn ensure_registered(&self, tileset_id: &str) -> Result<()> {
        if self.registered.contains_key(tileset_id) {
            return Ok(());
        }
        match self.read_metadata(tileset_id).await? {
            Some(meta) => {
                self.registered.insert(tileset_id.to_string(), meta);
                Ok(())
            }
            None => Err(KilnError::TilesetNotFound {
                tileset: tileset_id.to_string(),
            }),
        }
    }

    /// Registration check for mutations. Always asks the store, since another
    /// process may have destroyed the tileset since it was cached.
    async fn verify_registered(&self, tileset_id: &str) -> Result<()> {
        let path = Path::parse(Self::metadata_key(tileset_id))?;
        match self.inner.head(&path).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                if self.registered.remove(tileset_id).is_some() {
                    debug!(tileset = tileset_id, "tileset metadata gone, dropped from cache");
                }
                Err(KilnError::TilesetNotFound {
                    tileset: tileset_id.to_string(),
                })
            }
            Err(e) => {
                record_error(BACKEND, "read_metadata");
                Err(e.into())
            }
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<object_store::ObjectMeta>> {
        let path = Path::parse(prefix)?;
        let objects: Vec<_> = self.inner.list(Some(&path)).try_collect().await?;
        Ok(objects)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let objects = self.list_prefix(prefix).await?;
        let count = objects.len() as u64;
        let inner = &self.inner;
        futures::stream::iter(objects)
            .map(|meta| async move {
                match inner.delete(&meta.location).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(KilnError::from(e)),
                }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl TileStore for ObjectTileStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self, config), fields(tileset = %config.id))]
    async fn init_tileset(&self, config: &TilesetConfig) -> Result<()> {
        let start = Instant::now();
        let wanted = TilesetMetadata::from_config(config);

        if let Some(existing) = self.read_metadata(&config.id).await? {
            return if existing.same_definition(&wanted) {
                debug!("tileset already initialized");
                self.registered.insert(config.id.clone(), existing);
                Ok(())
            } else {
                Err(KilnError::TilesetAlreadyExists {
                    tileset: config.id.clone(),
                })
            };
        }

        let path = Path::parse(Self::metadata_key(&config.id))?;
        let body = Bytes::from(serde_json::to_vec(&wanted)?);
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        match self
            .inner
            .put_opts(&path, PutPayload::from(body), options)
            .await
        {
            Ok(_) => {}
            // Lost a race with another initializer; accept it if it wrote the same thing.
            Err(object_store::Error::AlreadyExists { .. }) => {
                let existing = self.read_metadata(&config.id).await?;
                if !existing.is_some_and(|m| m.same_definition(&wanted)) {
                    return Err(KilnError::TilesetAlreadyExists {
                        tileset: config.id.clone(),
                    });
                }
            }
            Err(e) => {
                record_error(BACKEND, "init_tileset");
                return Err(e.into());
            }
        }
        self.registered.insert(config.id.clone(), wanted);
        observe(BACKEND, "init_tileset", start);
        info!("initialized tileset storage");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_tileset(&self, tileset_id: &str) -> Result<()> {
        let start = Instant::now();
        if self.read_metadata(tileset_id).await?.is_none() {
            return Err(KilnError::TilesetNotFound {
                tileset: tileset_id.to_string(),
            });
        }
        let removed = self
            .delete_prefix(&Self::tiles_prefix(tileset_id, ZoomScope::All))
            .await?;
        let path = Path::parse(Self::metadata_key(tileset_id))?;
        self.inner.delete(&path).await?;
        self.registered.remove(tileset_id);
        observe(BACKEND, "destroy_tileset", start);
        info!(tiles = removed, "destroyed tileset storage");
        Ok(())
    }

    async fn tileset_ids(&self) -> Result<Vec<String>> {
        let listing = self.inner.list_with_delimiter(None).await?;
        let mut ids = Vec::new();
        for prefix in listing.common_prefixes {
            let id = prefix.to_string();
            if self.read_metadata(&id).await?.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn tileset_metadata(&self, tileset_id: &str) -> Result<TilesetMetadata> {
        self.read_metadata(tileset_id)
            .await?
            .ok_or_else(|| KilnError::TilesetNotFound {
                tileset: tileset_id.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn zoom_stats(&self, tileset_id: &str) -> Result<Vec<ZoomStats>> {
        self.ensure_registered(tileset_id).await?;
        let objects = self
            .list_prefix(&Self::tiles_prefix(tileset_id, ZoomScope::All))
            .await?;
        let mut by_zoom: BTreeMap<u8, ZoomStats> = BTreeMap::new();
        for meta in objects {
            // <id>/tiles/<z>/<x>/<y>.mvt
            let Some(zoom) = meta
                .location
                .parts()
                .nth(2)
                .and_then(|part| part.as_ref().parse::<u8>().ok())
            else {
                continue;
            };
            let entry = by_zoom.entry(zoom).or_insert(ZoomStats {
                zoom,
                tiles: 0,
                bytes: 0,
            });
            entry.tiles += 1;
            entry.bytes += meta.size as u64;
        }
        Ok(by_zoom.into_values().collect())
    }

    #[instrument(skip(self, payload), fields(size = payload.len()))]
    async fn put(&self, tileset_id: &str, coordinate: TileCoordinate, payload: Bytes) -> Result<()> {
        let start = Instant::now();
        self.verify_registered(tileset_id).await?;
        let path = Path::parse(Self::tile_key(tileset_id, coordinate))?;
        self.inner
            .put(&path, PutPayload::from(payload))
            .await
            .inspect_err(|_| record_error(BACKEND, "put"))?;
        observe(BACKEND, "put", start);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        tileset_id: &str,
        coordinate: TileCoordinate,
    ) -> Result<Option<StoredTile>> {
        let start = Instant::now();
        self.ensure_registered(tileset_id).await?;
        let path = Path::parse(Self::tile_key(tileset_id, coordinate))?;
        let result = match self.inner.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                observe(BACKEND, "get", start);
                return Ok(None);
            }
            Err(e) => {
                record_error(BACKEND, "get");
                return Err(e.into());
            }
        };
        let generated_at = Some(result.meta.last_modified);
        let payload = result.bytes().await?;
        observe(BACKEND, "get", start);
        debug!(size = payload.len(), "tile read");
        Ok(Some(StoredTile {
            payload,
            generated_at,
        }))
    }

    async fn exists(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<bool> {
        let start = Instant::now();
        self.ensure_registered(tileset_id).await?;
        let path = Path::parse(Self::tile_key(tileset_id, coordinate))?;
        let result = match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => {
                record_error(BACKEND, "exists");
                Err(e.into())
            }
        };
        observe(BACKEND, "exists", start);
        result
    }

    #[instrument(skip(self))]
    async fn delete(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<()> {
        let start = Instant::now();
        self.verify_registered(tileset_id).await?;
        let path = Path::parse(Self::tile_key(tileset_id, coordinate))?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                record_error(BACKEND, "delete");
                return Err(e.into());
            }
        }
        observe(BACKEND, "delete", start);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_zoom(&self, tileset_id: &str, scope: ZoomScope) -> Result<u64> {
        let start = Instant::now();
        self.verify_registered(tileset_id).await?;
        let removed = self
            .delete_prefix(&Self::tiles_prefix(tileset_id, scope))
            .await
            .inspect_err(|_| record_error(BACKEND, "delete_zoom"))?;
        observe(BACKEND, "delete_zoom", start);
        debug!(removed, "deleted tiles");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.inner.list_with_delimiter(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tileset::tests::config_from;
    use object_store::memory::InMemory;

    fn store() -> ObjectTileStore {
        ObjectTileStore::new(Arc::new(InMemory::new()))
    }

    fn tileset(id: &str, maxzoom: u8) -> TilesetConfig {
        let yaml = format!(
            "metadata: {{id: {id}}}\nvector_layers:\n  water:\n    sql:\n      - {{minzoom: 0, maxzoom: {maxzoom}, file: q.sql}}\n"
        );
        config_from(&yaml, &[("q.sql", "SELECT 1")]).unwrap()
    }

    fn tile(z: u32, x: u32, y: u32) -> TileCoordinate {
        TileCoordinate::new(z, x, y).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let s = store();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        s.put("osm", tile(3, 1, 2), Bytes::from_static(b"tile-bytes"))
            .await
            .unwrap();
        let got = s.get("osm", tile(3, 1, 2)).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"tile-bytes"));
        assert!(got.generated_at.is_some());
        assert!(s.exists("osm", tile(3, 1, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_tile_is_none() {
        let s = store();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        assert!(s.get("osm", tile(3, 0, 0)).await.unwrap().is_none());
        assert!(!s.exists("osm", tile(3, 0, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let s = store();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        s.put("osm", tile(1, 0, 0), Bytes::from_static(b"one")).await.unwrap();
        s.put("osm", tile(1, 0, 0), Bytes::from_static(b"two")).await.unwrap();
        let got = s.get("osm", tile(1, 0, 0)).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_unregistered_tileset() {
        let s = store();
        let err = s
            .put("ghost", tile(0, 0, 0), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::TilesetNotFound { .. }));
        assert!(matches!(
            s.get("ghost", tile(0, 0, 0)).await,
            Err(KilnError::TilesetNotFound { .. })
        ));
        assert!(matches!(
            s.tileset_metadata("ghost").await,
            Err(KilnError::TilesetNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_is_idempotent_for_same_definition() {
        let s = store();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        let err = s.init_tileset(&tileset("osm", 12)).await.unwrap_err();
        assert!(matches!(err, KilnError::TilesetAlreadyExists { .. }));
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_delete_and_delete_zoom() {
        let s = store();
        s.init_tileset(&tileset("osm", 8)).await.unwrap();
        for t in [tile(1, 0, 0), tile(1, 1, 0), tile(2, 0, 0), tile(2, 3, 3)] {
            s.put("osm", t, Bytes::from_static(b"abc")).await.unwrap();
        }

        s.delete("osm", tile(1, 0, 0)).await.unwrap();
        s.delete("osm", tile(1, 0, 0)).await.unwrap();
        assert!(!s.exists("osm", tile(1, 0, 0)).await.unwrap());

        assert_eq!(s.delete_zoom("osm", ZoomScope::Zoom(2)).await.unwrap(), 2);
        assert!(s.exists("osm", tile(1, 1, 0)).await.unwrap());
        assert!(!s.exists("osm", tile(2, 3, 3)).await.unwrap());

        assert_eq!(s.delete_zoom("osm", ZoomScope::All).await.unwrap(), 1);
        assert!(s.zoom_stats("osm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zoom_stats() {
        let s = store();
        s.init_tileset(&tileset("osm", 12)).await.unwrap();
        s.put("osm", tile(1, 0, 0), Bytes::from_static(b"ab")).await.unwrap();
        s.put("osm", tile(10, 5, 5), Bytes::from_static(b"abc")).await.unwrap();
        s.put("osm", tile(10, 6, 5), Bytes::from_static(b"abcd")).await.unwrap();
        let stats = s.zoom_stats("osm").await.unwrap();
        assert_eq!(
            stats,
            vec![
                ZoomStats { zoom: 1, tiles: 1, bytes: 2 },
                ZoomStats { zoom: 10, tiles: 2, bytes: 7 },
            ]
        );
    }

    #[tokio::test]
    async fn test_tilesets_are_isolated_and_listed() {
        let s = store();
        s.init_tileset(&tileset("b", 4)).await.unwrap();
        s.init_tileset(&tileset("a", 4)).await.unwrap();
        s.put("a", tile(0, 0, 0), Bytes::from_static(b"a")).await.unwrap();
        assert!(s.get("b", tile(0, 0, 0)).await.unwrap().is_none());
        assert_eq!(s.tileset_ids().await.unwrap(), vec!["a", "b"]);

        let meta = s.tileset_metadata("a").await.unwrap();
        assert_eq!(meta.layers, vec!["water"]);
        assert_eq!(meta.maxzoom, Some(4));
    }

    #[tokio::test]
    async fn test_destroy_tileset() {
        let s = store();
        s.init_tileset(&tileset("osm", 4)).await.unwrap();
        s.init_tileset(&tileset("keep", 4)).await.unwrap();
        s.put("osm", tile(2, 1, 1), Bytes::from_static(b"x")).await.unwrap();

        s.destroy_tileset("osm").await.unwrap();
        assert_eq!(s.tileset_ids().await.unwrap(), vec!["keep"]);
        assert!(matches!(
            s.get("osm", tile(2, 1, 1)).await,
            Err(KilnError::TilesetNotFound { .. })
        ));
        assert!(matches!(
            s.destroy_tileset("osm").await,
            Err(KilnError::TilesetNotFound { .. })
        ));

        // Re-initializing after destroy starts empty.
        s.init_tileset(&tileset("osm", 6)).await.unwrap();
        assert!(s.get("osm", tile(2, 1, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_by_other_process_stops_writes() {
        let shared: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let server = ObjectTileStore::new(shared.clone());
        let admin = ObjectTileStore::new(shared);

        server.init_tileset(&tileset("osm", 4)).await.unwrap();
        server.put("osm", tile(1, 0, 0), Bytes::from_static(b"old")).await.unwrap();

        admin.destroy_tileset("osm").await.unwrap();

        let err = server
            .put("osm", tile(1, 1, 1), Bytes::from_static(b"orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::TilesetNotFound { .. }));
        assert!(matches!(
            server.delete("osm", tile(1, 0, 0)).await,
            Err(KilnError::TilesetNotFound { .. })
        ));

        admin.init_tileset(&tileset("osm", 4)).await.unwrap();
        assert!(admin.get("osm", tile(1, 1, 1)).await.unwrap().is_none());
        assert!(admin.zoom_stats("osm").await.unwrap().is_empty());

        // Once re-registered, the other process can write again.
        server.put("osm", tile(1, 1, 1), Bytes::from_static(b"new")).await.unwrap();
        let got = admin.get("osm", tile(1, 1, 1)).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            bucket: dir.path().join("tiles").to_string_lossy().to_string(),
            ..StorageConfig::default()
        };
        let s = ObjectTileStore::from_config(&config).unwrap();
        s.init_tileset(&tileset("osm", 4)).await.unwrap();
        s.put("osm", tile(4, 3, 2), Bytes::from_static(b"on-disk")).await.unwrap();
        assert!(dir.path().join("tiles/osm/tiles/4/3/2.mvt").exists());
        s.ping().await.unwrap();
    }
}
