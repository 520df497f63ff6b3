use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Resampling kernel used when a crop is scaled to the model input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    Nearest,
    #[default]
    Bilinear,
}

impl std::str::FromStr for Resampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            other => Err(format!("unknown resampling '{other}' (expected nearest or bilinear)")),
        }
    }
}

/// Accepted range of a polygon's longer pixel-space bounding box side.
/// Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeConstraint {
    pub min_side_dim: u32,
    pub max_side_dim: u32,
}

impl SizeConstraint {
    pub fn new(min_side_dim: u32, max_side_dim: u32) -> Self {
        Self { min_side_dim, max_side_dim }
    }

    #[inline]
    pub fn admits(&self, side: u32) -> bool {
        self.min_side_dim <= side && side <= self.max_side_dim
    }
}

/// User-facing job options. Every field has a default, so a partial JSON
/// document (or `{}`) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Smallest accepted bounding box side in pixels (0 = no lower bound).
    pub min_side_dim: u32,
    /// Largest accepted bounding box side in pixels; `None` uses the model input side.
    pub max_side_dim: Option<u32>,
    /// Bit depth chips are cast to before inference.
    pub bit_depth: u8,
    /// Maximum number of chips resident in memory at once.
    pub chips_in_mem: usize,
    /// Ordered class names; presence selects named labels.
    pub class_names: Option<Vec<String>>,
    pub resampling: Resampling,
    /// Zero chip pixels whose source pixel centre lies outside the polygon.
    pub mask_outside_polygon: bool,
    /// Output property receiving the class label.
    pub class_property: String,
    /// Output property receiving the winning class probability, if set.
    pub confidence_property: Option<String>,
    /// Input property naming the raster tile a feature lies on.
    pub tile_property: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_side_dim: 0,
            max_side_dim: None,
            bit_depth: 8,
            chips_in_mem: 1000,
            class_names: None,
            resampling: Resampling::Bilinear,
            mask_outside_polygon: false,
            class_property: "class".to_string(),
            confidence_property: None,
            tile_property: "image_id".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reject option combinations that can never produce a run.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.chips_in_mem == 0 {
            return Err(PipelineError::InvalidConfig("chips_in_mem must be at least 1".into()));
        }
        if !(1..=16).contains(&self.bit_depth) {
            return Err(PipelineError::InvalidConfig(format!(
                "bit_depth must be within 1..=16, got {}",
                self.bit_depth
            )));
        }
        if let Some(max) = self.max_side_dim {
            if self.min_side_dim > max {
                return Err(PipelineError::InvalidConfig(format!(
                    "min_side_dim {} exceeds max_side_dim {max}",
                    self.min_side_dim
                )));
            }
        }
        if self.class_property.is_empty() {
            return Err(PipelineError::InvalidConfig("class_property must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve the size window against the model's input side.
    pub fn size_constraint(&self, model_side: u32) -> SizeConstraint {
        SizeConstraint::new(self.min_side_dim, self.max_side_dim.unwrap_or(model_side))
    }
}

/// Parse the comma-separated class list accepted on the command line.
/// Entries are trimmed; an empty string yields `None`.
pub fn parse_class_list(raw: &str) -> Option<Vec<String>> {
    if raw.trim().is_empty() {
        return None;
    }
    Some(raw.split(',').map(|c| c.trim().to_string()).collect())
}
