//! In-memory raster tiles and their geo ↔ pixel mapping.
//! Coordinate math uses f64; sample values use f32.

pub mod geotiff;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use geo::{Coord, Rect};
use log::debug;

use crate::error::PipelineResult;
use crate::vector::Feature;

/// Values this close to an integer pixel edge are snapped onto it, so that
/// polygons digitised on pixel boundaries get exact extents.
const PIXEL_SNAP: f64 = 1e-6;

/// Affine mapping from pixel (col, row) to geo (x, y):
///
/// ```text
/// x = c[0] + col * c[1] + row * c[2]
/// y = c[3] + col * c[4] + row * c[5]
/// ```
///
/// `(col, row) = (0, 0)` is the top-left corner of the top-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub coeffs: [f64; 6],
}

impl GeoTransform {
    pub fn new(coeffs: [f64; 6]) -> Self {
        Self { coeffs }
    }

    /// Pixel grid == geo grid, rows increasing downwards.
    pub fn identity() -> Self {
        Self::new([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// North-up grid with square-ish pixels anchored at the top-left corner.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self::new([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height])
    }

    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.coeffs;
        (c[0] + col * c[1] + row * c[2], c[3] + col * c[4] + row * c[5])
    }

    /// Inverse mapping. Returns `None` for a singular transform.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let c = &self.coeffs;
        let det = c[1] * c[5] - c[2] * c[4];
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = x - c[0];
        let dy = y - c[3];
        let col = (c[5] * dx - c[2] * dy) / det;
        let row = (c[1] * dy - c[4] * dx) / det;
        Some((col, row))
    }

    /// Integer pixel window enclosing a geo rectangle.
    pub fn pixel_window(&self, rect: &Rect<f64>) -> Option<PixelWindow> {
        let (min, max) = (rect.min(), rect.max());
        self.pixel_extent([
            Coord { x: min.x, y: min.y },
            Coord { x: max.x, y: min.y },
            Coord { x: min.x, y: max.y },
            Coord { x: max.x, y: max.y },
        ])
    }

    /// Integer pixel window enclosing a set of geo points. On rotated grids
    /// this is tighter than the window of their geo bounding box.
    pub fn pixel_extent(&self, coords: impl IntoIterator<Item = Coord<f64>>) -> Option<PixelWindow> {
        let mut col_lo = f64::INFINITY;
        let mut col_hi = f64::NEG_INFINITY;
        let mut row_lo = f64::INFINITY;
        let mut row_hi = f64::NEG_INFINITY;
        for c in coords {
            let (col, row) = self.geo_to_pixel(c.x, c.y)?;
            col_lo = col_lo.min(col);
            col_hi = col_hi.max(col);
            row_lo = row_lo.min(row);
            row_hi = row_hi.max(row);
        }
        if !(col_lo.is_finite() && col_hi.is_finite() && row_lo.is_finite() && row_hi.is_finite()) {
            return None;
        }

        let col0 = snap(col_lo).floor();
        let col1 = snap(col_hi).ceil();
        let row0 = snap(row_lo).floor();
        let row1 = snap(row_hi).ceil();
        Some(PixelWindow {
            col0: col0 as i64,
            row0: row0 as i64,
            width: (col1 - col0) as u32,
            height: (row1 - row0) as u32,
        })
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[inline]
fn snap(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < PIXEL_SNAP {
        r
    } else {
        v
    }
}

/// Axis-aligned pixel rectangle on a tile. May extend past the tile edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col0: i64,
    pub row0: i64,
    pub width: u32,
    pub height: u32,
}

impl PixelWindow {
    #[inline]
    pub fn longer_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A multi-band raster held in memory, band-sequential, row-major per band.
#[derive(Debug, Clone)]
pub struct RasterTile {
    /// File stem of the source image; features refer to tiles by this name.
    pub id: String,
    pub bands: usize,
    pub width: usize,
    pub height: usize,
    /// Bits per sample for integer sources, `None` for floating point.
    pub bit_depth: Option<u8>,
    pub transform: GeoTransform,
    pub data: Vec<f32>,
}

impl RasterTile {
    /// Create a tile filled with the given value.
    pub fn new(id: impl Into<String>, bands: usize, width: usize, height: usize, bit_depth: Option<u8>, fill: f32) -> Self {
        Self {
            id: id.into(),
            bands,
            width,
            height,
            bit_depth,
            transform: GeoTransform::identity(),
            data: vec![fill; bands * width * height],
        }
    }

    pub fn with_transform(mut self, transform: GeoTransform) -> Self {
        self.transform = transform;
        self
    }

    #[inline]
    pub fn get(&self, band: usize, row: usize, col: usize) -> f32 {
        self.data[(band * self.height + row) * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, band: usize, row: usize, col: usize, val: f32) {
        self.data[(band * self.height + row) * self.width + col] = val;
    }

    /// True if the window lies entirely on the tile.
    pub fn covers(&self, window: &PixelWindow) -> bool {
        window.col0 >= 0
            && window.row0 >= 0
            && window.col0 + window.width as i64 <= self.width as i64
            && window.row0 + window.height as i64 <= self.height as i64
    }

    /// Largest representable source value, used for bit-depth rescaling.
    pub fn max_value(&self) -> Option<f32> {
        self.bit_depth.map(|d| ((1u64 << d) - 1) as f32)
    }
}

/// Named collection of tiles a job reads from.
#[derive(Debug, Default)]
pub struct RasterCatalog {
    tiles: Vec<RasterTile>,
    by_id: HashMap<String, usize>,
}

impl RasterCatalog {
    pub fn new(tiles: Vec<RasterTile>) -> Self {
        let by_id = tiles.iter().enumerate().map(|(i, t)| (t.id.clone(), i)).collect();
        Self { tiles, by_id }
    }

    /// Load every `.tif` / `.tiff` in `dir`, ordered by file name.
    pub fn from_dir(dir: &Path) -> PipelineResult<Self> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_tiff(p))
            .collect();
        paths.sort();

        let mut tiles = Vec::with_capacity(paths.len());
        for path in &paths {
            let tile = geotiff::read_tile(path)?;
            debug!(
                "loaded tile {} ({} bands, {}x{})",
                tile.id, tile.bands, tile.width, tile.height
            );
            tiles.push(tile);
        }
        Ok(Self::new(tiles))
    }

    pub fn tiles(&self) -> &[RasterTile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RasterTile> {
        self.by_id.get(id).map(|&i| &self.tiles[i])
    }

    /// Tile a feature lies on: named by its `tile_property` (with or without a
    /// file extension), or the only tile when the catalog holds exactly one.
    pub fn resolve(&self, feature: &Feature, tile_property: &str) -> Option<&RasterTile> {
        match feature.properties.get(tile_property).and_then(|v| v.as_str()) {
            Some(name) => self.get(name).or_else(|| {
                let stem = Path::new(name).file_stem()?.to_str()?;
                self.get(stem)
            }),
            None if self.tiles.len() == 1 => self.tiles.first(),
            None => None,
        }
    }
}

pub(crate) fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}
