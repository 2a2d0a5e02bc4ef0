//! Tile persistence.
//!
//! [`TileStore`] is the only long-lived mutable state in the system. Every
//! operation is scoped to one tile or one tileset; writes are last-write-wins.

pub mod object;
pub mod postgres;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, StorageBackend};
use crate::error::Result;
use crate::tile::TileCoordinate;
use crate::tileset::TilesetConfig;

pub use object::ObjectTileStore;
pub use postgres::PgTileStore;

/// Which tiles of a tileset a bulk delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomScope {
    All,
    Zoom(u8),
}

/// Registration record written by [`TileStore::init_tileset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilesetMetadata {
    pub id: String,
    pub layers: Vec<String>,
    pub minzoom: Option<u8>,
    pub maxzoom: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl TilesetMetadata {
    pub fn from_config(config: &TilesetConfig) -> Self {
        Self {
            id: config.id.clone(),
            layers: config.layer_names(),
            minzoom: config.minzoom(),
            maxzoom: config.maxzoom(),
            created_at: Utc::now(),
        }
    }

    /// True when both describe the same layers and zooms. Creation time is ignored.
    pub fn same_definition(&self, other: &TilesetMetadata) -> bool {
        self.id == other.id
            && self.layers == other.layers
            && self.minzoom == other.minzoom
            && self.maxzoom == other.maxzoom
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTile {
    pub payload: Bytes,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoomStats {
    pub zoom: u8,
    pub tiles: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait TileStore: Send + Sync {
    /// Short backend name used in metrics and logs.
    fn backend(&self) -> &'static str;

    /// Create storage for a tileset and register its metadata. Repeating the
    /// call with an identical definition is a no-op; a different definition
    /// under the same id fails with `TilesetAlreadyExists`.
    async fn init_tileset(&self, config: &TilesetConfig) -> Result<()>;

    /// Drop a tileset's tiles and metadata. Shared metadata storage stays.
    async fn destroy_tileset(&self, tileset_id: &str) -> Result<()>;

    async fn tileset_ids(&self) -> Result<Vec<String>>;

    /// Fails with `TilesetNotFound` for unregistered ids.
    async fn tileset_metadata(&self, tileset_id: &str) -> Result<TilesetMetadata>;

    /// Tile count and payload bytes per zoom, ascending.
    async fn zoom_stats(&self, tileset_id: &str) -> Result<Vec<ZoomStats>>;

    /// Idempotent upsert.
    async fn put(&self, tileset_id: &str, coordinate: TileCoordinate, payload: Bytes)
        -> Result<()>;

    /// `Ok(None)` only when the tile is absent. Any other failure is an error.
    async fn get(&self, tileset_id: &str, coordinate: TileCoordinate)
        -> Result<Option<StoredTile>>;

    async fn exists(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<bool>;

    /// Deleting an absent tile succeeds.
    async fn delete(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<()>;

    /// Returns the number of tiles removed.
    async fn delete_zoom(&self, tileset_id: &str, scope: ZoomScope) -> Result<u64>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// Build the store selected by `config.storage.backend`.
pub async fn connect(config: &Config) -> Result<Arc<dyn TileStore>> {
    let store: Arc<dyn TileStore> = match config.storage.backend {
        StorageBackend::Postgres => Arc::new(
            PgTileStore::connect(config.storage_url(), config.storage.max_connections).await?,
        ),
        _ => Arc::new(ObjectTileStore::from_config(&config.storage)?),
    };
    tracing::info!(backend = store.backend(), "tile storage ready");
    Ok(store)
}

fn observe(backend: &str, operation: &str, start: Instant) {
    crate::metrics::STORAGE_OPERATION_DURATION
        .with_label_values(&[backend, operation])
        .observe(start.elapsed().as_secs_f64());
}

fn record_error(backend: &str, operation: &str) {
    crate::metrics::STORAGE_ERRORS_TOTAL
        .with_label_values(&[backend, operation])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(layers: &[&str], minzoom: Option<u8>, maxzoom: Option<u8>) -> TilesetMetadata {
        TilesetMetadata {
            id: "osm".into(),
            layers: layers.iter().map(|s| s.to_string()).collect(),
            minzoom,
            maxzoom,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_same_definition_ignores_created_at() {
        let a = meta(&["water"], Some(0), Some(8));
        let mut b = a.clone();
        b.created_at = a.created_at - chrono::Duration::days(3);
        assert!(a.same_definition(&b));
    }

    #[test]
    fn test_same_definition_compares_layers_and_zooms() {
        let a = meta(&["water", "roads"], Some(0), Some(14));
        assert!(!a.same_definition(&meta(&["roads", "water"], Some(0), Some(14))));
        assert!(!a.same_definition(&meta(&["water", "roads"], Some(0), Some(12))));
    }

    #[test]
    fn test_metadata_json_shape() {
        let m = meta(&["water"], Some(0), Some(8));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["layers"][0], "water");
        assert_eq!(json["maxzoom"], 8);
        let back: TilesetMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
