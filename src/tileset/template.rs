use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

use crate::error::{KilnError, Result};
use crate::geomath::TileGeometry;

const TEMPLATE_NAME: &str = "query";

/// A parsed layer query template.
///
/// Templates use Jinja syntax. Undefined names are errors rather than empty
/// strings, so a typo in a variable surfaces the first time the template is
/// rendered, which config validation does before anything is served.
#[derive(Clone)]
pub struct QueryTemplate {
    env: Environment<'static>,
    layer: String,
}

/// Values a template may reference. `bbox` and `unbuffered_bbox` are SQL
/// expressions, everything else is numeric.
#[derive(Debug, Serialize)]
struct Substitutions {
    zoom: u8,
    x: u32,
    y: u32,
    extent: u32,
    buffer: u32,
    bbox: String,
    unbuffered_bbox: String,
    tile_length: f64,
    tile_area: f64,
    coordinate_length: f64,
    coordinate_area: f64,
}

impl From<&TileGeometry> for Substitutions {
    fn from(g: &TileGeometry) -> Self {
        Self {
            zoom: g.coordinate.zoom(),
            x: g.coordinate.x(),
            y: g.coordinate.y(),
            extent: g.extent,
            buffer: g.buffer,
            bbox: g.bbox_sql(),
            unbuffered_bbox: g.unbuffered_bbox_sql(),
            tile_length: g.tile_length,
            tile_area: g.tile_area,
            coordinate_length: g.coordinate_length,
            coordinate_area: g.coordinate_area,
        }
    }
}

impl QueryTemplate {
    /// Parse `source`. Syntax errors are reported against `layer`.
    pub fn parse(layer: &str, source: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .map_err(|e| template_error(layer, e))?;
        Ok(Self {
            env,
            layer: layer.to_string(),
        })
    }

    /// Render the feature query for one tile.
    pub fn render(&self, geometry: &TileGeometry) -> Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| template_error(&self.layer, e))?;
        template
            .render(Substitutions::from(geometry))
            .map_err(|e| template_error(&self.layer, e))
    }
}

impl std::fmt::Debug for QueryTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTemplate")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

/// Wrap a feature query so the database returns the layer as one MVT blob.
pub fn wrap_layer_query(layer: &str, extent: u32, feature_query: &str) -> String {
    format!(
        "WITH mvtgeom AS\n(\n{feature_query}\n)\nSELECT ST_AsMVT(mvtgeom.*, '{}', {extent}, 'way', NULL)\nFROM mvtgeom;",
        layer.replace('\'', "''")
    )
}

fn template_error(layer: &str, e: minijinja::Error) -> KilnError {
    KilnError::Template {
        layer: layer.to_string(),
        message: e.to_string(),
    }
}
