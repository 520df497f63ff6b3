//! Chip extraction: crop a feature's pixel window, resample it to the model's
//! square input side, and cast samples to the configured bit depth.

use geo::{Contains, Coord};

use crate::config::Resampling;
use crate::error::{DropReason, ExtractionError};
use crate::size_filter::Placement;
use crate::vector::Feature;

/// Fixed-shape model input, band-sequential `[bands][side][side]`.
/// Sample values are integers in `[0, 2^bit_depth - 1]` stored as f32.
#[derive(Debug, Clone, PartialEq)]
pub struct Chip {
    pub bands: usize,
    pub side: usize,
    pub bit_depth: u8,
    pub data: Vec<f32>,
}

impl Chip {
    pub fn zeros(bands: usize, side: usize, bit_depth: u8) -> Self {
        Self { bands, side, bit_depth, data: vec![0.0; bands * side * side] }
    }

    #[inline]
    pub fn get(&self, band: usize, row: usize, col: usize) -> f32 {
        self.data[(band * self.side + row) * self.side + col]
    }

    #[inline]
    pub fn set(&mut self, band: usize, row: usize, col: usize, val: f32) {
        self.data[(band * self.side + row) * self.side + col] = val;
    }

    pub fn band(&self, band: usize) -> &[f32] {
        let n = self.side * self.side;
        &self.data[band * n..(band + 1) * n]
    }

    pub fn max_value(&self) -> f32 {
        max_for_depth(self.bit_depth)
    }

    /// Samples scaled to `[0, 1]`.
    pub fn normalized(&self) -> Vec<f32> {
        let max = self.max_value();
        self.data.iter().map(|v| v / max).collect()
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.bands, self.side, self.side]
    }
}

#[inline]
fn max_for_depth(bit_depth: u8) -> f32 {
    ((1u64 << bit_depth) - 1) as f32
}

#[derive(Debug, Clone, Copy)]
pub struct ChipExtractor {
    pub side: usize,
    pub bit_depth: u8,
    pub resampling: Resampling,
    pub mask_outside_polygon: bool,
}

impl ChipExtractor {
    pub fn new(side: usize, bit_depth: u8, resampling: Resampling) -> Self {
        Self { side, bit_depth, resampling, mask_outside_polygon: false }
    }

    pub fn with_mask(mut self, mask: bool) -> Self {
        self.mask_outside_polygon = mask;
        self
    }

    /// Cut the chip for one placed feature. The window must lie fully on the
    /// tile; partial coverage is a per-feature failure.
    pub fn extract(&self, feature: &Feature, placement: &Placement<'_>) -> Result<Chip, ExtractionError> {
        let tile = placement.tile;
        let window = placement.window;
        if window.is_empty() || !tile.covers(&window) {
            return Err(ExtractionError {
                feature_id: feature.id.clone(),
                reason: DropReason::OutOfCoverage,
            });
        }

        let side = self.side;
        let (w, h) = (window.width as usize, window.height as usize);
        let (col0, row0) = (window.col0 as usize, window.row0 as usize);
        let scale_x = w as f64 / side as f64;
        let scale_y = h as f64 / side as f64;

        let target_max = max_for_depth(self.bit_depth);
        let gain = match tile.max_value() {
            Some(src_max) if src_max > 0.0 => target_max / src_max,
            _ => 1.0,
        };
        let cast = |v: f32| (v * gain).round().clamp(0.0, target_max);

        let mut chip = Chip::zeros(tile.bands, side, self.bit_depth);
        for r in 0..side {
            // Output pixel centre in window pixel coordinates.
            let cy = (r as f64 + 0.5) * scale_y;
            for c in 0..side {
                let cx = (c as f64 + 0.5) * scale_x;

                if self.mask_outside_polygon && !self.inside(feature, placement, col0 as f64 + cx, row0 as f64 + cy) {
                    continue;
                }

                match self.resampling {
                    Resampling::Nearest => {
                        let sx = (cx.floor() as usize).min(w - 1);
                        let sy = (cy.floor() as usize).min(h - 1);
                        for b in 0..tile.bands {
                            chip.set(b, r, c, cast(tile.get(b, row0 + sy, col0 + sx)));
                        }
                    }
                    Resampling::Bilinear => {
                        let fx = (cx - 0.5).clamp(0.0, (w - 1) as f64);
                        let fy = (cy - 0.5).clamp(0.0, (h - 1) as f64);
                        let x0 = fx.floor() as usize;
                        let y0 = fy.floor() as usize;
                        let x1 = (x0 + 1).min(w - 1);
                        let y1 = (y0 + 1).min(h - 1);
                        let tx = (fx - x0 as f64) as f32;
                        let ty = (fy - y0 as f64) as f32;
                        for b in 0..tile.bands {
                            let v00 = tile.get(b, row0 + y0, col0 + x0);
                            let v10 = tile.get(b, row0 + y0, col0 + x1);
                            let v01 = tile.get(b, row0 + y1, col0 + x0);
                            let v11 = tile.get(b, row0 + y1, col0 + x1);
                            let v = v00 * (1.0 - tx) * (1.0 - ty)
                                + v10 * tx * (1.0 - ty)
                                + v01 * (1.0 - tx) * ty
                                + v11 * tx * ty;
                            chip.set(b, r, c, cast(v));
                        }
                    }
                }
            }
        }
        Ok(chip)
    }

    /// Is the tile position (col, row) inside the feature's polygon?
    fn inside(&self, feature: &Feature, placement: &Placement<'_>, col: f64, row: f64) -> bool {
        let Some(shape) = feature.shape.as_ref() else {
            return false;
        };
        let (x, y) = placement.tile.transform.pixel_to_geo(col, row);
        let point = Coord { x, y };
        shape.0.iter().any(|poly| poly.contains(&point))
    }
}
