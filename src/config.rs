use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process configuration. Tileset definitions live in their own YAML files
/// (see [`crate::tileset::TilesetConfig`]); this covers connections, the HTTP
/// listener and logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL prefix used for tile URLs in TileJSON. Derived from
    /// host and port when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Tiles generated concurrently by bulk commands.
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,
}

/// The PostGIS database layer queries run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Per-layer query timeout. Zero disables it.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Local,
    Memory,
    S3,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Local => "local",
            StorageBackend::Memory => "memory",
            StorageBackend::S3 => "s3",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageBackend {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            "s3" => Ok(StorageBackend::S3),
            other => Err(KilnError::Config(format!(
                "unknown storage backend: {other} (expected postgres, local, memory or s3)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    // Postgres
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Bucket name for S3, directory for local.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    // S3 / MinIO / R2
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_allow_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    60
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_bulk_concurrency() -> usize {
    4
}
fn default_database_url() -> String {
    "postgres://localhost/gis".to_string()
}
fn default_max_connections() -> u32 {
    8
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_query_timeout_ms() -> u64 {
    30_000
}
fn default_backend() -> StorageBackend {
    StorageBackend::Postgres
}
fn default_bucket() -> String {
    "tilekiln".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "plain".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            bulk_concurrency: default_bulk_concurrency(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            max_connections: default_max_connections(),
            bucket: default_bucket(),
            s3_region: None,
            s3_endpoint: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_allow_http: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    /// URL prefix for tile URLs handed out in TileJSON.
    pub fn public_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    KilnError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| KilnError::Config(format!("failed to parse config: {e}")))
    }

    /// Storage URL, falling back to the source database when unset. Tiles are
    /// commonly kept in the same database they are generated from.
    pub fn storage_url(&self) -> &str {
        self.storage.url.as_deref().unwrap_or(&self.source.url)
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) -> Result<()> {
        // Server
        if let Ok(v) = std::env::var("TILEKILN_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env_parse("TILEKILN_PORT") {
            self.server.port = v;
        }
        if let Some(v) = env_non_empty("TILEKILN_BASE_URL") {
            self.server.base_url = Some(v);
        }
        if let Some(v) = env_parse("TILEKILN_REQUEST_TIMEOUT_SECS") {
            self.server.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("TILEKILN_SHUTDOWN_TIMEOUT_SECS") {
            self.server.shutdown_timeout_secs = v;
        }
        if let Some(v) = env_parse("TILEKILN_BULK_CONCURRENCY") {
            self.server.bulk_concurrency = v;
        }

        // Source
        if let Some(v) = env_non_empty("TILEKILN_SOURCE_URL") {
            self.source.url = v;
        }
        if let Some(v) = env_parse("TILEKILN_SOURCE_MAX_CONNECTIONS") {
            self.source.max_connections = v;
        }
        if let Some(v) = env_parse("TILEKILN_QUERY_TIMEOUT_MS") {
            self.source.query_timeout_ms = v;
        }

        // Storage
        if let Some(v) = env_non_empty("TILEKILN_STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = env_non_empty("TILEKILN_STORAGE_URL") {
            self.storage.url = Some(v);
        }
        if let Some(v) = env_parse("TILEKILN_STORAGE_MAX_CONNECTIONS") {
            self.storage.max_connections = v;
        }
        if let Some(v) = env_non_empty("TILEKILN_STORAGE_BUCKET") {
            self.storage.bucket = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION") {
            self.storage.s3_region = Some(v);
        }
        if let Some(v) = env_non_empty("S3_ENDPOINT") {
            self.storage.s3_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_ACCESS_KEY_ID") {
            self.storage.s3_access_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            self.storage.s3_secret_access_key = Some(v);
        }
        if let Ok(v) = std::env::var("S3_ALLOW_HTTP") {
            self.storage.s3_allow_http = v == "true";
        }

        // Logging
        if let Ok(v) = std::env::var("TILEKILN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("TILEKILN_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}
