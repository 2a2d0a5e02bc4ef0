//! Tile generation: one query per eligible layer, concatenated in layer order.

pub mod source;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, instrument, warn};

use crate::error::{KilnError, Result};
use crate::metrics::{GaugeGuard, ACTIVE_GENERATIONS};
use crate::tile::TileCoordinate;
use crate::tileset::{plan, TilesetConfig};

pub use source::{PgSource, SourceDatabase};

/// A freshly generated tile. Never cached by the generator; ownership passes
/// to the caller.
#[derive(Debug, Clone)]
pub struct RenderedTile {
    pub tileset_id: String,
    pub coordinate: TileCoordinate,
    /// Concatenated layer blobs. Empty layers are omitted, so this may be empty.
    pub payload: Bytes,
    pub generated_at: DateTime<Utc>,
}

/// A fully rendered layer statement, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerQuery {
    pub layer: String,
    pub sql: String,
}

/// Render the statement for every layer that has a range at the coordinate's
/// zoom, in declaration order. With `only`, layers not named are skipped;
/// names that match no layer are ignored.
pub fn layer_queries(
    config: &TilesetConfig,
    coordinate: TileCoordinate,
    only: Option<&[String]>,
) -> Result<Vec<LayerQuery>> {
    plan(config, coordinate.zoom())
        .into_iter()
        .filter(|p| only.map_or(true, |names| names.iter().any(|n| n == p.name())))
        .filter_map(|p| p.range.map(|range| (p.layer, range)))
        .map(|(layer, range)| {
            Ok(LayerQuery {
                layer: layer.name.clone(),
                sql: range.render_sql(&layer.name, coordinate)?,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct TileGenerator {
    source: Arc<dyn SourceDatabase>,
    query_timeout: Option<Duration>,
}

impl TileGenerator {
    pub fn new(source: Arc<dyn SourceDatabase>, query_timeout: Option<Duration>) -> Self {
        Self {
            source,
            query_timeout,
        }
    }

    /// Generator with the timeout taken from config; zero means no timeout.
    pub fn with_timeout_ms(source: Arc<dyn SourceDatabase>, timeout_ms: u64) -> Self {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        Self::new(source, timeout)
    }

    pub async fn generate(
        &self,
        config: &TilesetConfig,
        coordinate: TileCoordinate,
    ) -> Result<RenderedTile> {
        self.generate_layers(config, coordinate, None).await
    }

    /// Generate a tile from a subset of layers. Any layer failure fails the
    /// whole tile; partial tiles are never returned.
    #[instrument(skip(self, config, only), fields(tileset = %config.id, tile = %coordinate))]
    pub async fn generate_layers(
        &self,
        config: &TilesetConfig,
        coordinate: TileCoordinate,
        only: Option<&[String]>,
    ) -> Result<RenderedTile> {
        let _active = GaugeGuard::inc(&ACTIVE_GENERATIONS);
        let start = Instant::now();

        let queries = layer_queries(config, coordinate, only)?;
        let blobs = try_join_all(
            queries
                .iter()
                .map(|q| self.run_layer(&config.id, &q.layer, &q.sql)),
        )
        .await?;

        let mut payload = BytesMut::new();
        for blob in blobs.into_iter().flatten() {
            payload.extend_from_slice(&blob);
        }
        let payload = payload.freeze();

        let elapsed = start.elapsed();
        crate::metrics::GENERATION_DURATION
            .with_label_values(&[&config.id])
            .observe(elapsed.as_secs_f64());
        crate::metrics::TILE_BYTES
            .with_label_values(&[&config.id])
            .observe(payload.len() as f64);
        debug!(
            elapsed_ms = elapsed.as_millis(),
            layers = queries.len(),
            size = payload.len(),
            "generated tile"
        );

        Ok(RenderedTile {
            tileset_id: config.id.clone(),
            coordinate,
            payload,
            generated_at: Utc::now(),
        })
    }

    async fn run_layer(&self, tileset: &str, layer: &str, sql: &str) -> Result<Option<Bytes>> {
        let query = self.source.query_layer(sql);
        let result = match self.query_timeout {
            Some(limit) => match tokio::time::timeout(limit, query).await {
                Ok(result) => result,
                Err(_) => {
                    crate::metrics::LAYER_QUERY_ERRORS_TOTAL
                        .with_label_values(&[tileset, layer])
                        .inc();
                    warn!(layer, timeout_ms = limit.as_millis() as u64, "layer query timed out");
                    return Err(KilnError::GenerationTimeout {
                        layer: layer.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => query.await,
        };
        result
            .map(|blob| blob.filter(|b| !b.is_empty()))
            .map_err(|e| {
                crate::metrics::LAYER_QUERY_ERRORS_TOTAL
                    .with_label_values(&[tileset, layer])
                    .inc();
                warn!(layer, error = %e, "layer query failed");
                KilnError::Generation {
                    layer: layer.to_string(),
                    cause: e.to_string(),
                }
            })
    }
}
