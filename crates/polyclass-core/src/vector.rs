//! GeoJSON feature I/O.
//!
//! Features keep the geometry, id and properties exactly as read so the
//! output collection echoes them; the polygonal part is converted once to
//! `geo` types for filtering and chip extraction.

use std::fmt;
use std::fs;
use std::path::Path;

use geo::{Geometry, MultiPolygon};
use geojson::feature::Id;
use geojson::{GeoJson, JsonObject, JsonValue};
use log::debug;
use serde::Serialize;

use crate::error::PipelineResult;

/// Stable identifier of an input feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FeatureId(pub String);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(s: &str) -> Self {
        FeatureId(s.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(s: String) -> Self {
        FeatureId(s)
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    /// GeoJSON `id` member as read, echoed back on output.
    pub raw_id: Option<Id>,
    /// Geometry as read, echoed back on output.
    pub geometry: Option<geojson::Geometry>,
    /// Polygonal part of the geometry; `None` for points, lines and nulls.
    pub shape: Option<MultiPolygon<f64>>,
    pub properties: JsonObject,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Option<geojson::Geometry>, properties: JsonObject) -> Self {
        let shape = geometry.as_ref().and_then(polygonal);
        Self {
            id: id.into(),
            raw_id: None,
            geometry,
            shape,
            properties,
        }
    }

    /// Wrap a parsed GeoJSON feature. Features without an `id` member are
    /// identified by their zero-based position in the input.
    pub fn from_geojson(index: usize, feature: geojson::Feature) -> Self {
        let id = match &feature.id {
            Some(Id::String(s)) => FeatureId(s.clone()),
            Some(Id::Number(n)) => FeatureId(n.to_string()),
            None => FeatureId(index.to_string()),
        };
        let mut out = Self::new(id, feature.geometry, feature.properties.unwrap_or_default());
        out.raw_id = feature.id;
        out
    }

    /// Copy of this feature carrying extra properties.
    pub fn to_geojson_with(&self, extra: impl IntoIterator<Item = (String, JsonValue)>) -> geojson::Feature {
        let mut properties = self.properties.clone();
        properties.extend(extra);
        geojson::Feature {
            bbox: None,
            geometry: self.geometry.clone(),
            id: self.raw_id.clone(),
            properties: Some(properties),
            foreign_members: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: &str, polygon: Option<geo::Polygon<f64>>, props: JsonValue) -> Self {
        let geometry = polygon.map(|p| geojson::Geometry::new(geojson::Value::from(&p)));
        let properties = match props {
            JsonValue::Object(map) => map,
            _ => JsonObject::new(),
        };
        Self::new(id, geometry, properties)
    }
}

/// Polygons contained in a GeoJSON geometry, flattening collections.
fn polygonal(geometry: &geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geom = Geometry::<f64>::try_from(geometry.clone()).ok()?;
    let mut polys = Vec::new();
    collect_polygons(geom, &mut polys);
    if polys.is_empty() {
        None
    } else {
        Some(MultiPolygon::new(polys))
    }
}

fn collect_polygons(geom: Geometry<f64>, out: &mut Vec<geo::Polygon<f64>>) {
    match geom {
        Geometry::Polygon(p) => out.push(p),
        Geometry::MultiPolygon(mp) => out.extend(mp.0),
        Geometry::Rect(r) => out.push(r.to_polygon()),
        Geometry::Triangle(t) => out.push(t.to_polygon()),
        Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                collect_polygons(g, out);
            }
        }
        _ => {}
    }
}

/// An ordered feature collection plus the collection-level members (such as
/// `crs`) that should survive a round trip.
#[derive(Debug, Clone, Default)]
pub struct VectorLayer {
    pub features: Vec<Feature>,
    pub foreign_members: Option<JsonObject>,
}

impl VectorLayer {
    pub fn read(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)?;
        let layer = Self::parse(&text)?;
        debug!("read {} features from {}", layer.features.len(), path.display());
        Ok(layer)
    }

    pub fn parse(text: &str) -> PipelineResult<Self> {
        let (raw, foreign_members) = match text.parse::<GeoJson>()? {
            GeoJson::FeatureCollection(fc) => (fc.features, fc.foreign_members),
            GeoJson::Feature(f) => (vec![f], None),
            GeoJson::Geometry(g) => (
                vec![geojson::Feature {
                    bbox: None,
                    geometry: Some(g),
                    id: None,
                    properties: None,
                    foreign_members: None,
                }],
                None,
            ),
        };
        let features = raw
            .into_iter()
            .enumerate()
            .map(|(i, f)| Feature::from_geojson(i, f))
            .collect();
        Ok(Self { features, foreign_members })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Finished output collection, ready to serialise.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedLayer {
    pub features: Vec<geojson::Feature>,
    pub foreign_members: Option<JsonObject>,
}

impl ClassifiedLayer {
    pub fn to_geojson(&self) -> GeoJson {
        GeoJson::FeatureCollection(geojson::FeatureCollection {
            bbox: None,
            features: self.features.clone(),
            foreign_members: self.foreign_members.clone(),
        })
    }

    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        fs::write(path, self.to_geojson().to_string())?;
        debug!("wrote {} features to {}", self.features.len(), path.display());
        Ok(())
    }
}
