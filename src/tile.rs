use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{KilnError, Result};

/// Highest zoom level accepted anywhere in the pipeline.
pub const MAX_ZOOM: u8 = 30;

/// A validated XYZ tile address.
///
/// Construction always checks `zoom <= MAX_ZOOM` and `x, y < 2^zoom`, so a
/// `TileCoordinate` in hand never needs re-validation before a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoordinate {
    zoom: u8,
    x: u32,
    y: u32,
}

impl TileCoordinate {
    pub fn new(zoom: u32, x: u32, y: u32) -> Result<Self> {
        if zoom > MAX_ZOOM as u32 {
            return Err(KilnError::InvalidCoordinate {
                zoom,
                x,
                y,
                reason: format!("zoom must be <= {MAX_ZOOM}"),
            });
        }
        let size = 1u64 << zoom;
        if x as u64 >= size {
            return Err(KilnError::InvalidCoordinate {
                zoom,
                x,
                y,
                reason: format!("x must be < {size}"),
            });
        }
        if y as u64 >= size {
            return Err(KilnError::InvalidCoordinate {
                zoom,
                x,
                y,
                reason: format!("y must be < {size}"),
            });
        }
        Ok(Self {
            zoom: zoom as u8,
            x,
            y,
        })
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// Linear id across all zooms: every tile of zoom `z` sorts after every
    /// tile of zoom `z - 1`, and tiles within a zoom follow a Hilbert curve.
    pub fn tile_id(&self) -> u64 {
        tiles_below(self.zoom) + hilbert_index(self.zoom, self.x as u64, self.y as u64)
    }

    /// Inverse of [`TileCoordinate::tile_id`].
    pub fn from_tile_id(id: u64) -> Result<Self> {
        let mut zoom = 0u8;
        while zoom < MAX_ZOOM && tiles_below(zoom + 1) <= id {
            zoom += 1;
        }
        let offset = id - tiles_below(zoom);
        if offset >= 1u64 << (2 * zoom as u32) {
            return Err(KilnError::Validation(format!(
                "tile id {id} is beyond zoom {MAX_ZOOM}"
            )));
        }
        let (x, y) = hilbert_point(zoom, offset);
        Self::new(zoom as u32, x as u32, y as u32)
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Parses the `z/x/y` form used by the batch interfaces.
impl FromStr for TileCoordinate {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() != 3 {
            return Err(KilnError::Validation(format!(
                "expected z/x/y, got '{trimmed}'"
            )));
        }
        let parse = |part: &str| {
            part.parse::<u32>().map_err(|_| {
                KilnError::Validation(format!("expected z/x/y, got '{trimmed}'"))
            })
        };
        Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?)
    }
}

/// Number of tiles in all zooms strictly below `zoom`.
fn tiles_below(zoom: u8) -> u64 {
    ((1u64 << (2 * zoom as u32)) - 1) / 3
}

fn hilbert_index(zoom: u8, mut x: u64, mut y: u64) -> u64 {
    let n = 1u64 << zoom;
    let mut d = 0u64;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from((x & s) > 0);
        let ry = u64::from((y & s) > 0);
        d += s * s * ((3 * rx) ^ ry);
        hilbert_rotate(n, &mut x, &mut y, rx, ry);
        s /= 2;
    }
    d
}

fn hilbert_point(zoom: u8, d: u64) -> (u64, u64) {
    let n = 1u64 << zoom;
    let (mut x, mut y) = (0u64, 0u64);
    let mut t = d;
    let mut s = 1u64;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        hilbert_rotate(s, &mut x, &mut y, rx, ry);
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x, y)
}

fn hilbert_rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n - 1 - *x;
            *y = n - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

/// Every tile from `minzoom` through `maxzoom`, in tile-id order.
///
/// Iterated lazily: a range up to zoom 30 is cheap to build and to `len()`.
#[derive(Debug, Clone)]
pub struct TileRange {
    next: u64,
    end: u64,
}

impl TileRange {
    pub fn new(minzoom: u8, maxzoom: u8) -> Result<Self> {
        if minzoom > maxzoom || maxzoom > MAX_ZOOM {
            return Err(KilnError::Validation(format!(
                "invalid zoom range {minzoom}..={maxzoom}"
            )));
        }
        Ok(Self {
            next: tiles_below(minzoom),
            end: tiles_below(maxzoom + 1),
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for TileRange {
    type Item = TileCoordinate;

    fn next(&mut self) -> Option<TileCoordinate> {
        if self.next >= self.end {
            return None;
        }
        let id = self.next;
        self.next += 1;
        TileCoordinate::from_tile_id(id).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.len()).unwrap_or(usize::MAX);
        (remaining, usize::try_from(self.len()).ok())
    }
}
