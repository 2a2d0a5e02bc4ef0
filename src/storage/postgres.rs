use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::{observe, record_error, StoredTile, TileStore, TilesetMetadata, ZoomScope, ZoomStats};
use crate::error::{KilnError, Result};
use crate::tile::TileCoordinate;
use crate::tileset::TilesetConfig;

const BACKEND: &str = "postgres";
const SCHEMA: &str = "tilekiln";
/// SQLSTATE for `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

/// Tile store in PostgreSQL.
///
/// A shared `tilekiln.metadata` table registers tilesets. Each tileset gets
/// its own table `tilekiln."<id>"`, list-partitioned by zoom with one
/// partition per zoom level.
#[derive(Clone)]
pub struct PgTileStore {
    pool: PgPool,
}

impl PgTileStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    fn table(tileset_id: &str) -> String {
        format!("{SCHEMA}.{}", quote_ident(tileset_id))
    }

    fn partition(tileset_id: &str, suffix: &str) -> String {
        format!("{SCHEMA}.{}", quote_ident(&format!("{tileset_id}_{suffix}")))
    }

    /// Map a missing tile table to `TilesetNotFound`.
    fn classify(tileset_id: &str, operation: &str, e: sqlx::Error) -> KilnError {
        if let sqlx::Error::Database(ref db) = e {
            if db.code().as_deref() == Some(UNDEFINED_TABLE) {
                return KilnError::TilesetNotFound {
                    tileset: tileset_id.to_string(),
                };
            }
        }
        record_error(BACKEND, operation);
        KilnError::Database(e)
    }

    async fn ensure_shared_tables(&self) -> Result<()> {
        // Concurrent `IF NOT EXISTS` DDL can still collide; serialize it.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(SCHEMA)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA}.metadata (
                id text PRIMARY KEY,
                layers text[] NOT NULL,
                minzoom smallint,
                maxzoom smallint,
                created timestamptz NOT NULL DEFAULT now()
            )"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_metadata(&self, tileset_id: &str) -> Result<Option<TilesetMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT id, layers, minzoom, maxzoom, created FROM {SCHEMA}.metadata WHERE id = $1"
        ))
        .bind(tileset_id)
        .fetch_optional(&self.pool)
        .await;
        let row = match row {
            Ok(row) => row,
            // No shared table yet means nothing is registered.
            Err(sqlx::Error::Database(ref db)) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        row.map(|r| metadata_from_row(&r)).transpose()
    }
}

fn metadata_from_row(row: &sqlx::postgres::PgRow) -> Result<TilesetMetadata> {
    let minzoom: Option<i16> = row.try_get("minzoom")?;
    let maxzoom: Option<i16> = row.try_get("maxzoom")?;
    Ok(TilesetMetadata {
        id: row.try_get("id")?,
        layers: row.try_get("layers")?,
        minzoom: minzoom.map(|z| z as u8),
        maxzoom: maxzoom.map(|z| z as u8),
        created_at: row.try_get::<DateTime<Utc>, _>("created")?,
    })
}

/// Double-quote a SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl TileStore for PgTileStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self, config), fields(tileset = %config.id))]
    async fn init_tileset(&self, config: &TilesetConfig) -> Result<()> {
        let start = Instant::now();
        self.ensure_shared_tables().await?;
        let wanted = TilesetMetadata::from_config(config);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.metadata (id, layers, minzoom, maxzoom)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(&wanted.id)
        .bind(&wanted.layers)
        .bind(wanted.minzoom.map(i16::from))
        .bind(wanted.maxzoom.map(i16::from))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let existing = self.read_metadata(&config.id).await?;
            return if existing.is_some_and(|m| m.same_definition(&wanted)) {
                debug!("tileset already initialized");
                Ok(())
            } else {
                Err(KilnError::TilesetAlreadyExists {
                    tileset: config.id.clone(),
                })
            };
        }

        let table = Self::table(&config.id);
        let zoom_check = match (wanted.minzoom, wanted.maxzoom) {
            (Some(min), Some(max)) => format!(",\n                CHECK (zoom >= {min} AND zoom <= {max})"),
            _ => String::new(),
        };
        sqlx::query(&format!(
            "CREATE TABLE {table} (
                zoom smallint NOT NULL,
                x integer NOT NULL,
                y integer NOT NULL,
                tile bytea NOT NULL,
                generated timestamptz NOT NULL DEFAULT now(),
                PRIMARY KEY (zoom, x, y),
                CHECK (x >= 0 AND x < (1 << zoom) AND y >= 0 AND y < (1 << zoom)){zoom_check}
            ) PARTITION BY LIST (zoom)"
        ))
        .execute(&mut *tx)
        .await?;
        // Tiles are already compressed; skip TOAST compression.
        sqlx::query(&format!(
            "ALTER TABLE {table} ALTER COLUMN tile SET STORAGE EXTERNAL"
        ))
        .execute(&mut *tx)
        .await?;

        match (wanted.minzoom, wanted.maxzoom) {
            (Some(min), Some(max)) => {
                for zoom in min..=max {
                    let partition = Self::partition(&config.id, &format!("z{zoom}"));
                    sqlx::query(&format!(
                        "CREATE TABLE {partition} PARTITION OF {table} FOR VALUES IN ({zoom})"
                    ))
                    .execute(&mut *tx)
                    .await?;
                }
            }
            _ => {
                let partition = Self::partition(&config.id, "default");
                sqlx::query(&format!("CREATE TABLE {partition} PARTITION OF {table} DEFAULT"))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        observe(BACKEND, "init_tileset", start);
        info!(
            minzoom = ?wanted.minzoom,
            maxzoom = ?wanted.maxzoom,
            "initialized tileset storage"
        );
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
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", Self::table(tileset_id)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM {SCHEMA}.metadata WHERE id = $1"))
            .bind(tileset_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        observe(BACKEND, "destroy_tileset", start);
        info!("destroyed tileset storage");
        Ok(())
    }

    async fn tileset_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(&format!(
            "SELECT id FROM {SCHEMA}.metadata ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await;
        match ids {
            Ok(ids) => Ok(ids),
            Err(sqlx::Error::Database(ref db)) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn tileset_metadata(&self, tileset_id: &str) -> Result<TilesetMetadata> {
        self.read_metadata(tileset_id)
            .await?
            .ok_or_else(|| KilnError::TilesetNotFound {
                tileset: tileset_id.to_string(),
            })
    }

    async fn zoom_stats(&self, tileset_id: &str) -> Result<Vec<ZoomStats>> {
        let rows: Vec<(i16, i64, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT zoom, count(*), sum(length(tile))::bigint FROM {} GROUP BY zoom ORDER BY zoom",
            Self::table(tileset_id)
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::classify(tileset_id, "zoom_stats", e))?;
        Ok(rows
            .into_iter()
            .map(|(zoom, tiles, bytes)| ZoomStats {
                zoom: zoom as u8,
                tiles: tiles as u64,
                bytes: bytes.unwrap_or(0) as u64,
            })
            .collect())
    }

    #[instrument(skip(self, payload), fields(size = payload.len()))]
    async fn put(&self, tileset_id: &str, coordinate: TileCoordinate, payload: Bytes) -> Result<()> {
        let start = Instant::now();
        sqlx::query(&format!(
            "INSERT INTO {} AS store (zoom, x, y, tile)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (zoom, x, y)
             DO UPDATE SET tile = EXCLUDED.tile, generated = now()",
            Self::table(tileset_id)
        ))
        .bind(i16::from(coordinate.zoom()))
        .bind(coordinate.x() as i32)
        .bind(coordinate.y() as i32)
        .bind(payload.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::classify(tileset_id, "put", e))?;
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
        let row: Option<(Vec<u8>, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT tile, generated FROM {} WHERE zoom = $1 AND x = $2 AND y = $3",
            Self::table(tileset_id)
        ))
        .bind(i16::from(coordinate.zoom()))
        .bind(coordinate.x() as i32)
        .bind(coordinate.y() as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::classify(tileset_id, "get", e))?;
        observe(BACKEND, "get", start);
        Ok(row.map(|(tile, generated)| StoredTile {
            payload: Bytes::from(tile),
            generated_at: Some(generated),
        }))
    }

    async fn exists(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<bool> {
        let start = Instant::now();
        let found: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE zoom = $1 AND x = $2 AND y = $3)",
            Self::table(tileset_id)
        ))
        .bind(i16::from(coordinate.zoom()))
        .bind(coordinate.x() as i32)
        .bind(coordinate.y() as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::classify(tileset_id, "exists", e))?;
        observe(BACKEND, "exists", start);
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn delete(&self, tileset_id: &str, coordinate: TileCoordinate) -> Result<()> {
        let start = Instant::now();
        sqlx::query(&format!(
            "DELETE FROM {} WHERE zoom = $1 AND x = $2 AND y = $3",
            Self::table(tileset_id)
        ))
        .bind(i16::from(coordinate.zoom()))
        .bind(coordinate.x() as i32)
        .bind(coordinate.y() as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::classify(tileset_id, "delete", e))?;
        observe(BACKEND, "delete", start);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_zoom(&self, tileset_id: &str, scope: ZoomScope) -> Result<u64> {
        let start = Instant::now();
        let table = Self::table(tileset_id);
        let result = match scope {
            ZoomScope::All => {
                sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&self.pool)
                    .await
            }
            ZoomScope::Zoom(zoom) => {
                sqlx::query(&format!("DELETE FROM {table} WHERE zoom = $1"))
                    .bind(i16::from(zoom))
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| Self::classify(tileset_id, "delete_zoom", e))?;
        observe(BACKEND, "delete_zoom", start);
        debug!(removed = result.rows_affected(), "deleted tiles");
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
