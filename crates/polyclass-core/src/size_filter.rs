//! Polygon size filter.
//!
//! A feature survives iff its geometry is a usable polygon, it resolves to a
//! raster tile, and the longer side of its pixel-space bounding box lies in
//! `[min_side_dim, max_side_dim]`. Everything else is dropped, never errored.
//! Survivors keep their input order.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Area, Line, LineString, MultiPolygon};
use log::debug;

use crate::config::SizeConstraint;
use crate::error::{DropReason, DropTally};
use crate::raster::{PixelWindow, RasterCatalog, RasterTile};
use crate::vector::Feature;

/// Where a surviving feature will be cut from.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub tile: &'a RasterTile,
    pub window: PixelWindow,
}

/// A feature that passed the filter, with its placement.
#[derive(Debug, Clone)]
pub struct Survivor<'a> {
    pub feature: Feature,
    pub placement: Placement<'a>,
}

pub struct SizeFilter<'a> {
    catalog: &'a RasterCatalog,
    constraint: SizeConstraint,
    tile_property: &'a str,
}

impl<'a> SizeFilter<'a> {
    pub fn new(catalog: &'a RasterCatalog, constraint: SizeConstraint, tile_property: &'a str) -> Self {
        Self { catalog, constraint, tile_property }
    }

    pub fn constraint(&self) -> SizeConstraint {
        self.constraint
    }

    /// Decide a single feature.
    pub fn admit(&self, feature: &Feature) -> Result<Placement<'a>, DropReason> {
        let shape = feature.shape.as_ref().ok_or(DropReason::NoGeometry)?;
        if is_degenerate(shape) {
            return Err(DropReason::Degenerate);
        }
        let tile = self
            .catalog
            .resolve(feature, self.tile_property)
            .ok_or(DropReason::NoTile)?;
        let vertices = shape.0.iter().flat_map(|poly| poly.exterior().0.iter().copied());
        let window = tile.transform.pixel_extent(vertices).ok_or(DropReason::Degenerate)?;
        if window.is_empty() {
            return Err(DropReason::Degenerate);
        }

        let side = window.longer_side();
        if side < self.constraint.min_side_dim {
            return Err(DropReason::TooSmall);
        }
        if side > self.constraint.max_side_dim {
            return Err(DropReason::TooLarge);
        }
        Ok(Placement { tile, window })
    }

    /// Keep admitted features in input order, tallying the rest.
    pub fn retain(&self, features: Vec<Feature>, tally: &mut DropTally) -> Vec<Survivor<'a>> {
        let mut out = Vec::with_capacity(features.len());
        for feature in features {
            match self.admit(&feature) {
                Ok(placement) => out.push(Survivor { feature, placement }),
                Err(reason) => {
                    debug!("dropping feature {}: {reason}", feature.id);
                    tally.record(reason);
                }
            }
        }
        out
    }
}

/// Zero-area, non-finite, under-sized or self-intersecting polygons cannot
/// yield a meaningful chip.
pub fn is_degenerate(shape: &MultiPolygon<f64>) -> bool {
    if shape.0.is_empty() {
        return true;
    }
    let area = shape.unsigned_area();
    if !area.is_finite() || area <= 0.0 {
        return true;
    }
    shape.0.iter().any(|poly| {
        std::iter::once(poly.exterior())
            .chain(poly.interiors())
            .any(|ring| ring.0.len() < 4 || ring.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) || ring_self_intersects(ring))
    })
}

/// True if two non-adjacent edges of a closed ring touch, or any two edges overlap.
///
/// Edges are swept in order of their left x; only edges whose x ranges
/// overlap are tested against each other.
fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let edges: Vec<Line<f64>> = ring.lines().filter(|l| l.start != l.end).collect();
    let n = edges.len();
    let x_range = |l: &Line<f64>| (l.start.x.min(l.end.x), l.start.x.max(l.end.x));

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x_range(&edges[a]).0.total_cmp(&x_range(&edges[b]).0));

    let mut active: Vec<usize> = Vec::new();
    for &i in &order {
        let (lo, _) = x_range(&edges[i]);
        active.retain(|&j| x_range(&edges[j]).1 >= lo);
        for &j in &active {
            let (a, b) = (i.min(j), i.max(j));
            let adjacent = b == a + 1 || (a == 0 && b == n - 1);
            match line_intersection(edges[a], edges[b]) {
                None => {}
                Some(LineIntersection::SinglePoint { is_proper, .. }) => {
                    if is_proper || !adjacent {
                        return true;
                    }
                }
                Some(LineIntersection::Collinear { .. }) => return true,
            }
        }
        active.push(i);
    }
    false
}
