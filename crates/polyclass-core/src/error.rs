//! Error taxonomy for the classification pipeline.
//!
//! Hard failures live in [`PipelineError`] and abort the run before any output
//! is written. Per-feature soft failures are [`DropReason`]s: the feature is
//! counted, logged and left out of the output collection.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::vector::FeatureId;

/// Error type returned by classifier backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("tile {tile} has {actual} bands but the model expects {expected}")]
    BandMismatch {
        tile: String,
        expected: usize,
        actual: usize,
    },

    #[error("input feature collection is empty")]
    EmptyInput,

    #[error("no imagery found in the input tiles")]
    NoImagery,

    #[error("{actual} class names supplied but the model outputs {expected} classes")]
    ClassCountMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("classifier failed on batch {batch}: {source}")]
    Inference {
        batch: usize,
        #[source]
        source: BoxError,
    },

    #[error("class index {index} is out of range for {len} class names")]
    ClassIndexOutOfRange { index: usize, len: usize },

    #[error("prediction for feature {prediction} does not line up with feature {feature}")]
    PredictionMismatch {
        feature: FeatureId,
        prediction: FeatureId,
    },

    #[error("{predictions} predictions for {features} surviving features")]
    PredictionCount { features: usize, predictions: usize },

    #[error("run cancelled after {batches} batches")]
    Cancelled { batches: usize },

    #[error("cannot read raster {}: {source}", .path.display())]
    Raster {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("raster {}: {reason}", .path.display())]
    RasterLayout { path: PathBuf, reason: String },

    #[error("GeoJSON error: {0}")]
    Vector(#[from] geojson::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for the configuration family: the job was set up wrong and no
    /// inference may run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::BandMismatch { .. }
                | PipelineError::EmptyInput
                | PipelineError::NoImagery
                | PipelineError::ClassCountMismatch { .. }
                | PipelineError::InvalidConfig(_)
        )
    }
}

/// Why a feature was left out of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Null or non-polygonal geometry.
    NoGeometry,
    /// Zero area or self-intersecting rings.
    Degenerate,
    TooSmall,
    TooLarge,
    /// No raster tile could be resolved for the feature.
    NoTile,
    /// Bounding box not fully covered by the tile.
    OutOfCoverage,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::NoGeometry => "no polygonal geometry",
            DropReason::Degenerate => "degenerate geometry",
            DropReason::TooSmall => "smaller than min_side_dim",
            DropReason::TooLarge => "larger than max_side_dim",
            DropReason::NoTile => "no matching raster tile",
            DropReason::OutOfCoverage => "outside raster coverage",
        };
        f.write_str(s)
    }
}

/// A chip could not be cut for one feature. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot extract chip for feature {feature_id}: {reason}")]
pub struct ExtractionError {
    pub feature_id: FeatureId,
    pub reason: DropReason,
}

/// Count of dropped features per reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DropTally(BTreeMap<DropReason, usize>);

impl DropTally {
    pub fn record(&mut self, reason: DropReason) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: DropReason) -> usize {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DropReason, usize)> + '_ {
        self.0.iter().map(|(&r, &n)| (r, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_family() {
        let band = PipelineError::BandMismatch {
            tile: "a".into(),
            expected: 4,
            actual: 3,
        };
        assert!(band.is_configuration());
        assert!(PipelineError::EmptyInput.is_configuration());
        assert!(!PipelineError::ClassIndexOutOfRange { index: 3, len: 3 }.is_configuration());
        assert!(!PipelineError::Cancelled { batches: 1 }.is_configuration());
    }

    #[test]
    fn band_mismatch_message_names_tile() {
        let e = PipelineError::BandMismatch {
            tile: "scene_07".into(),
            expected: 4,
            actual: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("scene_07"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn tally_counts_per_reason() {
        let mut tally = DropTally::default();
        tally.record(DropReason::TooLarge);
        tally.record(DropReason::TooLarge);
        tally.record(DropReason::NoTile);
        assert_eq!(tally.get(DropReason::TooLarge), 2);
        assert_eq!(tally.get(DropReason::Degenerate), 0);
        assert_eq!(tally.total(), 3);
        assert_eq!(
            serde_json::to_value(&tally).unwrap(),
            serde_json::json!({"too_large": 2, "no_tile": 1})
        );
    }
}
