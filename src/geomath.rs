//! Web-Mercator tile geometry.
//!
//! Pure functions only. Inputs are assumed valid: the [`TileCoordinate`]
//! constructor has already bounded zoom, x and y.

use serde::Serialize;

use crate::tile::TileCoordinate;

/// Circumference of the Web-Mercator world square, in metres.
pub const WORLD_LENGTH: f64 = 40_075_016.68;

/// Axis-aligned Web-Mercator rectangle, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn contains(&self, other: &BBox) -> bool {
        self.west <= other.west
            && self.south <= other.south
            && self.east >= other.east
            && self.north >= other.north
    }

    fn expand(&self, by: f64) -> BBox {
        BBox {
            west: self.west - by,
            south: self.south - by,
            east: self.east + by,
            north: self.north + by,
        }
    }
}

/// Per-tile quantities exposed to query templates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileGeometry {
    pub coordinate: TileCoordinate,
    pub extent: u32,
    pub buffer: u32,
    pub tile_length: f64,
    pub tile_area: f64,
    pub coordinate_length: f64,
    pub coordinate_area: f64,
    pub unbuffered_bbox: BBox,
    pub bbox: BBox,
}

impl TileGeometry {
    /// `extent` must be non-zero; `buffer` is in tile coordinate-space units.
    pub fn new(coordinate: TileCoordinate, extent: u32, buffer: u32) -> Self {
        let tile_length = tile_length(coordinate.zoom());
        let coordinate_length = tile_length / extent as f64;

        let half = WORLD_LENGTH / 2.0;
        let west = -half + coordinate.x() as f64 * tile_length;
        let north = half - coordinate.y() as f64 * tile_length;
        let unbuffered_bbox = BBox {
            west,
            south: north - tile_length,
            east: west + tile_length,
            north,
        };
        let bbox = unbuffered_bbox.expand(buffer as f64 * coordinate_length);

        Self {
            coordinate,
            extent,
            buffer,
            tile_length,
            tile_area: tile_length * tile_length,
            coordinate_length,
            coordinate_area: coordinate_length * coordinate_length,
            unbuffered_bbox,
            bbox,
        }
    }

    /// Buffer expressed as a fraction of the tile, the unit `ST_TileEnvelope` takes.
    pub fn margin(&self) -> f64 {
        self.buffer as f64 / self.extent as f64
    }

    /// SQL expression evaluating to the buffered tile envelope.
    pub fn bbox_sql(&self) -> String {
        envelope_sql(&self.coordinate, self.margin())
    }

    /// SQL expression evaluating to the tile envelope without buffer.
    pub fn unbuffered_bbox_sql(&self) -> String {
        envelope_sql(&self.coordinate, 0.0)
    }
}

pub fn tile_length(zoom: u8) -> f64 {
    WORLD_LENGTH / (1u64 << zoom) as f64
}

fn envelope_sql(coordinate: &TileCoordinate, margin: f64) -> String {
    format!(
        "ST_TileEnvelope({}, {}, {}, margin=>{})",
        coordinate.zoom(),
        coordinate.x(),
        coordinate.y(),
        margin
    )
}
