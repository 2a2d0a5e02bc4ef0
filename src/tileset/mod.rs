//! Tileset definitions: metadata, vector layers and their zoom-ranged queries.
//!
//! A [`TilesetConfig`] is built once from YAML, validated eagerly, and then
//! shared read-only (behind an `Arc`) by every request for the process lifetime.

pub mod planner;
pub mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tilejson::{tilejson, Bounds, Center, TileJSON};
use tracing::{debug, info};

use crate::error::{KilnError, Result};
use crate::geomath::TileGeometry;
use crate::tile::{TileCoordinate, MAX_ZOOM};

pub use planner::{plan, PlannedLayer};
pub use template::{wrap_layer_query, QueryTemplate};

pub const DEFAULT_EXTENT: u32 = 4096;
pub const DEFAULT_BUFFER: u32 = 0;
const MAX_TILESET_ID_LENGTH: usize = 50;

#[derive(Debug, Clone)]
pub struct TilesetConfig {
    /// Storage key prefix; also used as a SQL table name.
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub attribution: Option<String>,
    pub bounds: Option<Bounds>,
    pub center: Option<Center>,
    /// In declaration order. Tile payloads concatenate layers in this order.
    pub layers: Vec<VectorLayer>,
}

#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub name: String,
    /// Field name to human description. Informational only.
    pub fields: BTreeMap<String, String>,
    pub description: Option<String>,
    pub ranges: Vec<QueryRange>,
}

#[derive(Debug, Clone)]
pub struct QueryRange {
    pub minzoom: u8,
    pub maxzoom: u8,
    pub extent: u32,
    pub buffer: u32,
    pub template: QueryTemplate,
}

impl QueryRange {
    pub fn contains(&self, zoom: u8) -> bool {
        self.minzoom <= zoom && zoom <= self.maxzoom
    }

    /// Render the full layer query (template wrapped in `ST_AsMVT`) for a tile.
    pub fn render_sql(&self, layer: &str, coordinate: TileCoordinate) -> Result<String> {
        let geometry = TileGeometry::new(coordinate, self.extent, self.buffer);
        let feature_query = self.template.render(&geometry)?;
        Ok(wrap_layer_query(layer, self.extent, &feature_query))
    }

    fn label(&self) -> String {
        format!("[{}, {}]", self.minzoom, self.maxzoom)
    }
}

impl VectorLayer {
    pub fn minzoom(&self) -> Option<u8> {
        self.ranges.iter().map(|r| r.minzoom).min()
    }

    pub fn maxzoom(&self) -> Option<u8> {
        self.ranges.iter().map(|r| r.maxzoom).max()
    }

    /// The single range covering `zoom`, if any.
    pub fn range_for(&self, zoom: u8) -> Option<&QueryRange> {
        self.ranges.iter().find(|r| r.contains(zoom))
    }
}

// Raw YAML shapes.

#[derive(Debug, Deserialize)]
struct RawTileset {
    metadata: RawMetadata,
    #[serde(default)]
    vector_layers: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    id: String,
    #[serde(default)]
    bounds: Option<Vec<f64>>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    attribution: Option<String>,
    #[serde(default)]
    center: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sql: Vec<RawRange>,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    minzoom: u8,
    maxzoom: u8,
    #[serde(default = "default_extent")]
    extent: u32,
    #[serde(default)]
    buffer: u32,
    file: PathBuf,
}

fn default_extent() -> u32 {
    DEFAULT_EXTENT
}

impl TilesetConfig {
    /// Load a tileset from a YAML file. Template `file` paths resolve relative
    /// to the directory holding the YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read tileset {}: {e}", path.display()))
        })?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let config = Self::from_yaml(&yaml, |file| {
            let full = root.join(file);
            std::fs::read_to_string(&full).map_err(|e| {
                KilnError::Config(format!("failed to read template {}: {e}", full.display()))
            })
        })?;
        info!(
            tileset = %config.id,
            layers = config.layers.len(),
            minzoom = ?config.minzoom(),
            maxzoom = ?config.maxzoom(),
            "loaded tileset"
        );
        Ok(config)
    }

    /// Build and validate a tileset from YAML, reading template sources
    /// through `read_template`.
    pub fn from_yaml<F>(yaml: &str, read_template: F) -> Result<Self>
    where
        F: Fn(&Path) -> Result<String>,
    {
        let raw: RawTileset = serde_yaml::from_str(yaml)?;

        let mut layers = Vec::with_capacity(raw.vector_layers.len());
        for (key, value) in raw.vector_layers {
            let name = key
                .as_str()
                .ok_or_else(|| KilnError::Config(format!("layer name must be a string: {key:?}")))?
                .to_string();
            let raw_layer: RawLayer = if value.is_null() {
                RawLayer {
                    fields: BTreeMap::new(),
                    description: None,
                    sql: Vec::new(),
                }
            } else {
                serde_yaml::from_value(value)?
            };

            let mut ranges = Vec::with_capacity(raw_layer.sql.len());
            for r in raw_layer.sql {
                let source = read_template(&r.file)?;
                ranges.push(QueryRange {
                    minzoom: r.minzoom,
                    maxzoom: r.maxzoom,
                    extent: r.extent,
                    buffer: r.buffer,
                    template: QueryTemplate::parse(&name, source)?,
                });
            }

            layers.push(VectorLayer {
                name,
                fields: raw_layer.fields,
                description: raw_layer.description,
                ranges,
            });
        }

        let meta = raw.metadata;
        let config = Self {
            bounds: meta.bounds.as_deref().map(parse_bounds).transpose()?,
            center: meta.center.as_deref().map(parse_center).transpose()?,
            id: meta.id,
            name: meta.name,
            description: meta.description,
            version: meta.version,
            attribution: meta.attribution,
            layers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every load-time invariant. Called by the constructors; exposed
    /// for configs assembled in code.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_tileset_id(&self.id) {
            return Err(KilnError::Config(format!(
                "invalid tileset id '{}': must be 1-{MAX_TILESET_ID_LENGTH} chars, start with \
                 alphanumeric, and contain only alphanumeric, dash, or underscore characters",
                self.id
            )));
        }

        for layer in &self.layers {
            for range in &layer.ranges {
                if range.minzoom > range.maxzoom || range.maxzoom > MAX_ZOOM {
                    return Err(KilnError::Config(format!(
                        "layer {}: zoom range {} must satisfy minzoom <= maxzoom <= {MAX_ZOOM}",
                        layer.name,
                        range.label()
                    )));
                }
                if range.extent == 0 {
                    return Err(KilnError::Config(format!(
                        "layer {}: extent must be > 0",
                        layer.name
                    )));
                }
            }

            let mut sorted: Vec<&QueryRange> = layer.ranges.iter().collect();
            sorted.sort_by_key(|r| (r.minzoom, r.maxzoom));
            for pair in sorted.windows(2) {
                if pair[1].minzoom <= pair[0].maxzoom {
                    return Err(KilnError::ZoomRangeOverlap {
                        layer: layer.name.clone(),
                        first: pair[0].label(),
                        second: pair[1].label(),
                    });
                }
            }

            // Render once against a synthetic tile so undefined variables fail now.
            for range in &layer.ranges {
                let probe = TileCoordinate::new(range.minzoom as u32, 0, 0)?;
                range.render_sql(&layer.name, probe)?;
            }
            debug!(layer = %layer.name, ranges = layer.ranges.len(), "validated layer");
        }
        Ok(())
    }

    pub fn layer(&self, name: &str) -> Option<&VectorLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    /// Fail with `UnknownLayer` on the first name not declared in this tileset.
    pub fn check_layer_names<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        for name in names {
            if self.layer(name.as_ref()).is_none() {
                return Err(KilnError::UnknownLayer {
                    layer: name.as_ref().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn minzoom(&self) -> Option<u8> {
        self.layers.iter().filter_map(VectorLayer::minzoom).min()
    }

    pub fn maxzoom(&self) -> Option<u8> {
        self.layers.iter().filter_map(VectorLayer::maxzoom).max()
    }

    /// TileJSON 3.0.0 document with tile URLs under `base_url`.
    pub fn tilejson(&self, base_url: &str) -> TileJSON {
        let url = format!(
            "{}/{}/{{z}}/{{x}}/{{y}}.mvt",
            base_url.trim_end_matches('/'),
            self.id
        );
        let mut tj = tilejson! { tiles: vec![url] };
        tj.name = self.name.clone();
        tj.description = self.description.clone();
        tj.version = self.version.clone();
        tj.attribution = self.attribution.clone();
        tj.bounds = self.bounds;
        tj.center = self.center;
        tj.minzoom = self.minzoom();
        tj.maxzoom = self.maxzoom();
        tj.scheme = Some("xyz".to_string());
        tj.vector_layers = Some(
            self.layers
                .iter()
                .map(|layer| tilejson::VectorLayer {
                    id: layer.name.clone(),
                    fields: layer
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    description: layer.description.clone(),
                    minzoom: layer.minzoom(),
                    maxzoom: layer.maxzoom(),
                    other: Default::default(),
                })
                .collect(),
        );
        tj
    }
}

fn parse_bounds(values: &[f64]) -> Result<Bounds> {
    let [left, bottom, right, top] = values else {
        return Err(KilnError::InvalidBounds(format!(
            "expected [west, south, east, north], got {} values",
            values.len()
        )));
    };
    let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
    let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
    if !(lon_ok(*left) && lon_ok(*right) && lat_ok(*bottom) && lat_ok(*top)) {
        return Err(KilnError::InvalidBounds(format!(
            "{values:?} is outside longitude [-180, 180] / latitude [-90, 90]"
        )));
    }
    if bottom > top {
        return Err(KilnError::InvalidBounds(format!(
            "south {bottom} is greater than north {top}"
        )));
    }
    Ok(Bounds::new(*left, *bottom, *right, *top))
}

fn parse_center(values: &[f64]) -> Result<Center> {
    let (longitude, latitude, zoom) = match values {
        [lon, lat] => (*lon, *lat, 0.0),
        [lon, lat, zoom] => (*lon, *lat, *zoom),
        _ => {
            return Err(KilnError::Config(format!(
                "center must be [lon, lat] or [lon, lat, zoom], got {} values",
                values.len()
            )))
        }
    };
    if !(0.0..=MAX_ZOOM as f64).contains(&zoom) {
        return Err(KilnError::Config(format!("center zoom {zoom} is out of range")));
    }
    Ok(Center {
        longitude,
        latitude,
        zoom: zoom as u8,
    })
}

/// 1-50 chars, starts alphanumeric, only `[a-zA-Z0-9_-]`. The id ends up in
/// SQL identifiers and object keys, so nothing else is allowed.
fn is_valid_tileset_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_TILESET_ID_LENGTH {
        return false;
    }
    let bytes = id.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
