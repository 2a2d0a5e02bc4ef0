use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::Result;

/// The database layer queries execute against.
///
/// Each query is a complete `ST_AsMVT` statement returning at most one row
/// with one binary column. `None` and an empty buffer both mean the layer has
/// no features in the tile.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    async fn query_layer(&self, sql: &str) -> Result<Option<Bytes>>;
}

/// PostGIS source backed by a sqlx connection pool.
#[derive(Clone)]
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "connected to source database"
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceDatabase for PgSource {
    async fn query_layer(&self, sql: &str) -> Result<Option<Bytes>> {
        // The pool connection is released when this future completes or is dropped.
        let row: Option<Option<Vec<u8>>> = sqlx::query_scalar(sql)
            .fetch_optional(&self.pool)
            .await?;
        let blob = row.flatten().map(Bytes::from);
        debug!(size = blob.as_ref().map_or(0, Bytes::len), "layer query returned");
        Ok(blob)
    }
}
