use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    // Config errors
    #[error("config error: {0}")]
    Config(String),

    #[error("layer {layer}: zoom range {first} overlaps zoom range {second}")]
    ZoomRangeOverlap {
        layer: String,
        first: String,
        second: String,
    },

    #[error("template error in layer {layer}: {message}")]
    Template { layer: String, message: String },

    #[error("invalid bounds: {0}")]
    InvalidBounds(String),

    // Request errors
    #[error("invalid tile {zoom}/{x}/{y}: {reason}")]
    InvalidCoordinate {
        zoom: u32,
        x: u32,
        y: u32,
        reason: String,
    },

    #[error("unknown layer: {layer}")]
    UnknownLayer { layer: String },

    #[error("validation error: {0}")]
    Validation(String),

    // Generation errors
    #[error("generation of layer {layer} failed: {cause}")]
    Generation { layer: String, cause: String },

    #[error("generation of layer {layer} timed out after {timeout_ms}ms")]
    GenerationTimeout { layer: String, timeout_ms: u64 },

    // Storage errors
    #[error("tileset not found: {tileset}")]
    TilesetNotFound { tileset: String },

    #[error("tileset already exists: {tileset}")]
    TilesetAlreadyExists { tileset: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("object store path error: {0}")]
    ObjectStorePath(#[from] object_store::path::Error),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KilnError>;

impl KilnError {
    pub fn status_code(&self) -> u16 {
        match self {
            KilnError::InvalidCoordinate { .. }
            | KilnError::UnknownLayer { .. }
            | KilnError::Validation(_) => 400,

            KilnError::TilesetNotFound { .. } => 404,

            KilnError::TilesetAlreadyExists { .. } => 409,

            KilnError::GenerationTimeout { .. } => 504,

            _ => 500,
        }
    }

    /// True for the configuration-time kinds that must stop a process from starting.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            KilnError::Config(_)
                | KilnError::ZoomRangeOverlap { .. }
                | KilnError::Template { .. }
                | KilnError::InvalidBounds(_)
                | KilnError::Yaml(_)
        )
    }
}
