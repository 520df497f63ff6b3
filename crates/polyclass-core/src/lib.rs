//! Polygon classification over georeferenced imagery.
//!
//! Input polygons are filtered by pixel extent, cut out of their raster tile
//! as fixed-size chips, classified in memory-bounded batches and written back
//! with a class label. See [`pipeline::Pipeline`] for the end-to-end flow.

pub mod assemble;
pub mod bands;
pub mod chip;
pub mod classes;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod raster;
pub mod scheduler;
pub mod size_filter;
pub mod vector;

pub use config::{PipelineConfig, Resampling};
pub use error::{DropReason, PipelineError, PipelineResult};
pub use model::{BandStatsModel, Classifier, InputShape};
pub use pipeline::{Pipeline, RunOutput, RunReport};
pub use raster::{RasterCatalog, RasterTile};
pub use vector::{ClassifiedLayer, VectorLayer};
