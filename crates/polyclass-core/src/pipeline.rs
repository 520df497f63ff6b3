//! Pipeline orchestrator: runs every stage in order and produces the output
//! collection only once all of them succeed.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::assemble::ClassificationAssembler;
use crate::bands::validate_bands;
use crate::chip::{Chip, ChipExtractor};
use crate::classes::ClassSpace;
use crate::config::PipelineConfig;
use crate::error::{DropTally, ExtractionError, PipelineError, PipelineResult};
use crate::model::Classifier;
use crate::raster::RasterCatalog;
use crate::scheduler::BatchScheduler;
use crate::size_filter::{SizeFilter, Survivor};
use crate::vector::{ClassifiedLayer, Feature, VectorLayer};

/// Per-run counters, logged by the CLI and written next to the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub input: usize,
    pub dropped: DropTally,
    /// Features that passed the size filter.
    pub survived: usize,
    /// Chips cut successfully.
    pub extracted: usize,
    pub classified: usize,
    pub batches: usize,
    pub peak_resident: usize,
    pub chips_in_mem: usize,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub layer: ClassifiedLayer,
    pub report: RunReport,
}

pub struct Pipeline<'m, C: Classifier + ?Sized> {
    model: &'m C,
    config: PipelineConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'m, C: Classifier + ?Sized> Pipeline<'m, C> {
    pub fn new(model: &'m C, config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self { model, config, cancel: None })
    }

    /// Abort before the next batch once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline.
    ///
    /// Stage order:
    ///   1. Configuration checks (non-empty input and imagery, class names vs model width)
    ///   2. Band validation over every tile
    ///   3. Polygon size filtering
    ///   4. Chip extraction, pulled one buffer at a time
    ///   5. Batched inference
    ///   6. Label assembly
    pub fn run(&self, layer: VectorLayer, catalog: &RasterCatalog) -> PipelineResult<RunOutput> {
        let cfg = &self.config;
        let VectorLayer { features, foreign_members } = layer;

        // ── 1. Configuration ────────────────────────────────────────────────
        if features.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        if catalog.is_empty() {
            return Err(PipelineError::NoImagery);
        }
        let shape = self.model.input_shape();
        let space = ClassSpace::from_names(cfg.class_names.clone(), self.model.num_classes())?;

        // ── 2. Band validation ──────────────────────────────────────────────
        validate_bands(shape.bands, catalog.tiles())?;

        let mut report = RunReport {
            input: features.len(),
            chips_in_mem: cfg.chips_in_mem,
            ..RunReport::default()
        };

        // ── 3. Size filter ──────────────────────────────────────────────────
        let constraint = cfg.size_constraint(shape.side as u32);
        let filter = SizeFilter::new(catalog, constraint, &cfg.tile_property);
        let survivors = filter.retain(features, &mut report.dropped);
        report.survived = survivors.len();
        info!(
            "{} of {} features within {}..={} px",
            survivors.len(),
            report.input,
            constraint.min_side_dim,
            constraint.max_side_dim
        );

        // ── 4-6. Extraction, inference, assembly ────────────────────────────
        let extractor = ChipExtractor::new(shape.side, cfg.bit_depth, cfg.resampling)
            .with_mask(cfg.mask_outside_polygon);
        let mut scheduler = BatchScheduler::new(self.model, cfg.chips_in_mem)?;
        if let Some(flag) = &self.cancel {
            scheduler = scheduler.with_cancel(flag.clone());
        }
        let mut assembler = ClassificationAssembler::new(&space, &cfg.class_property)
            .with_confidence(cfg.confidence_property.as_deref());

        classify_survivors(survivors, &extractor, &mut scheduler, &mut report.dropped, |feature, prediction| {
            assembler.push(feature, prediction)
        })?;

        let stats = scheduler.stats();
        report.extracted = stats.chips;
        report.classified = assembler.len();
        report.batches = stats.batches;
        report.peak_resident = stats.peak_resident;
        info!(
            "classified {} features in {} batches ({} dropped)",
            report.classified,
            report.batches,
            report.dropped.total()
        );

        Ok(RunOutput {
            layer: ClassifiedLayer { features: assembler.finish(), foreign_members },
            report,
        })
    }
}

fn extract_one(extractor: &ChipExtractor, survivor: Survivor<'_>) -> Result<(Feature, Chip), ExtractionError> {
    let chip = extractor.extract(&survivor.feature, &survivor.placement)?;
    Ok((survivor.feature, chip))
}

fn record_drop(tally: &mut DropTally, err: ExtractionError) {
    warn!("{err}");
    tally.record(err.reason);
}

/// Sequential: chips are cut lazily as the scheduler's buffer pulls them.
#[cfg(not(feature = "threading"))]
fn classify_survivors<C, F>(
    survivors: Vec<Survivor<'_>>,
    extractor: &ChipExtractor,
    scheduler: &mut BatchScheduler<'_, C>,
    tally: &mut DropTally,
    mut sink: F,
) -> PipelineResult<()>
where
    C: Classifier + ?Sized,
    F: FnMut(&Feature, &crate::scheduler::Prediction) -> PipelineResult<()>,
{
    let pairs = survivors.into_iter().filter_map(|s| match extract_one(extractor, s) {
        Ok(pair) => Some(pair),
        Err(err) => {
            record_drop(tally, err);
            None
        }
    });
    for batch in scheduler.run(pairs) {
        for (feature, prediction) in batch? {
            sink(&feature, &prediction)?;
        }
    }
    Ok(())
}

/// Parallel: each buffer's worth of survivors is cut on the rayon pool, then
/// classified. Order within and across buffers is preserved.
#[cfg(feature = "threading")]
fn classify_survivors<C, F>(
    survivors: Vec<Survivor<'_>>,
    extractor: &ChipExtractor,
    scheduler: &mut BatchScheduler<'_, C>,
    tally: &mut DropTally,
    mut sink: F,
) -> PipelineResult<()>
where
    C: Classifier + ?Sized,
    F: FnMut(&Feature, &crate::scheduler::Prediction) -> PipelineResult<()>,
{
    use rayon::prelude::*;

    let capacity = scheduler.capacity();
    let mut pending = survivors.into_iter();
    loop {
        let chunk: Vec<Survivor<'_>> = pending.by_ref().take(capacity).collect();
        if chunk.is_empty() {
            return Ok(());
        }
        let results: Vec<_> = chunk.into_par_iter().map(|s| extract_one(extractor, s)).collect();
        let mut batch = Vec::with_capacity(results.len());
        for r in results {
            match r {
                Ok(pair) => batch.push(pair),
                Err(err) => record_drop(tally, err),
            }
        }
        if batch.is_empty() {
            continue;
        }
        for (feature, prediction) in scheduler.classify_batch(batch)? {
            sink(&feature, &prediction)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resampling;
    use crate::error::{BoxError, DropReason};
    use crate::model::InputShape;
    use crate::raster::RasterTile;
    use geo::{polygon, Polygon};
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::sync::atomic::Ordering;

    /// Predicts the rounded mean of band 0 modulo the class count, and records
    /// every batch size it was handed.
    struct MeanModel {
        bands: usize,
        side: usize,
        classes: usize,
        batch_sizes: RefCell<Vec<usize>>,
        calls: Cell<usize>,
    }

    impl MeanModel {
        fn new(bands: usize, side: usize, classes: usize) -> Self {
            Self { bands, side, classes, batch_sizes: RefCell::new(Vec::new()), calls: Cell::new(0) }
        }
    }

    impl Classifier for MeanModel {
        fn input_shape(&self) -> InputShape {
            InputShape::new(self.bands, self.side)
        }

        fn num_classes(&self) -> usize {
            self.classes
        }

        fn classify(&self, batch: &[Chip]) -> Result<Vec<Vec<f32>>, BoxError> {
            self.calls.set(self.calls.get() + 1);
            self.batch_sizes.borrow_mut().push(batch.len());
            Ok(batch
                .iter()
                .map(|chip| {
                    let band = chip.band(0);
                    let mean = band.iter().sum::<f32>() / band.len() as f32;
                    let mut d = vec![0.0; self.classes];
                    d[mean.round() as usize % self.classes] = 1.0;
                    d
                })
                .collect())
        }
    }

    fn rect_poly(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0)]
    }

    /// 200x20 single-row strip of 10 px wide cells; cell `i` holds value `i`.
    fn striped_tile(bands: usize) -> RasterTile {
        let mut tile = RasterTile::new("scene", bands, 200, 20, Some(8), 0.0);
        for b in 0..bands {
            for r in 0..20 {
                for c in 0..200 {
                    tile.set(b, r, c, (c / 10) as f32);
                }
            }
        }
        tile
    }

    /// Feature `i` covers stripe cell `i` exactly.
    fn cell_features(n: usize) -> VectorLayer {
        let features = (0..n)
            .map(|i| {
                let x0 = (i * 10) as f64;
                Feature::for_test(&format!("cell-{i}"), Some(rect_poly(x0, 0.0, x0 + 10.0, 10.0)), json!({"n": i}))
            })
            .collect();
        VectorLayer { features, foreign_members: None }
    }

    fn config(chips_in_mem: usize) -> PipelineConfig {
        PipelineConfig { chips_in_mem, resampling: Resampling::Nearest, ..PipelineConfig::default() }
    }

    fn labels(out: &RunOutput, key: &str) -> Vec<serde_json::Value> {
        out.layer.features.iter().map(|f| f.properties.as_ref().unwrap()[key].clone()).collect()
    }

    #[test]
    fn bounded_batches_over_many_features() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let pipeline = Pipeline::new(&model, config(2)).unwrap();

        let out = pipeline.run(cell_features(10), &catalog).unwrap();

        assert!(model.batch_sizes.borrow().iter().all(|&n| n <= 2));
        assert_eq!(out.report.peak_resident, 2);
        assert_eq!(out.report.batches, 5);
        assert_eq!(out.report.classified, 10);
    }

    #[test]
    fn labels_follow_input_order() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let out = Pipeline::new(&model, config(3)).unwrap().run(cell_features(7), &catalog).unwrap();
        assert_eq!(labels(&out, "class"), (0..7).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(labels(&out, "n"), (0..7).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn output_is_a_subset_without_duplicates() {
        let model = MeanModel::new(1, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(1)]);
        let mut layer = cell_features(4);
        // Too large, off the tile, and a point.
        layer.features.push(Feature::for_test("big", Some(rect_poly(0.0, 0.0, 15.0, 5.0)), json!({})));
        layer.features.push(Feature::for_test("off", Some(rect_poly(195.0, 0.0, 205.0, 10.0)), json!({})));
        layer.features.push(Feature::new("pt", Some(geojson::Geometry::new(geojson::Value::Point(vec![1.0, 1.0]))), Default::default()));

        let out = Pipeline::new(&model, config(1000)).unwrap().run(layer, &catalog).unwrap();

        let ids: Vec<_> = out
            .layer
            .features
            .iter()
            .map(|f| f.properties.as_ref().unwrap()["n"].clone())
            .collect();
        assert_eq!(ids, vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(out.report.input, 7);
        assert_eq!(out.report.survived, 5);
        assert_eq!(out.report.extracted, 4);
        assert_eq!(out.report.classified, 4);
        assert_eq!(out.report.dropped.get(DropReason::TooLarge), 1);
        assert_eq!(out.report.dropped.get(DropReason::OutOfCoverage), 1);
        assert_eq!(out.report.dropped.get(DropReason::NoGeometry), 1);
    }

    #[test]
    fn runs_are_idempotent() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let pipeline = Pipeline::new(&model, config(4)).unwrap();
        let a = pipeline.run(cell_features(9), &catalog).unwrap();
        let b = pipeline.run(cell_features(9), &catalog).unwrap();
        assert_eq!(labels(&a, "class"), labels(&b, "class"));
        assert_eq!(a.report, b.report);
    }

    #[test]
    fn band_mismatch_aborts_before_extraction() {
        let model = MeanModel::new(4, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let err = Pipeline::new(&model, config(2)).unwrap().run(cell_features(3), &catalog).unwrap_err();
        assert!(matches!(err, PipelineError::BandMismatch { expected: 4, actual: 3, .. }));
        assert_eq!(model.calls.get(), 0);
    }

    #[test]
    fn empty_input_is_a_configuration_error() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let err = Pipeline::new(&model, config(2)).unwrap().run(VectorLayer::default(), &catalog).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn missing_imagery_is_fatal_before_inference() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(Vec::new());
        let err = Pipeline::new(&model, config(2)).unwrap().run(cell_features(1), &catalog).unwrap_err();
        assert!(matches!(err, PipelineError::NoImagery));
        assert!(err.is_configuration());
        assert_eq!(model.calls.get(), 0);
    }

    #[test]
    fn named_classes_are_written() {
        let model = MeanModel::new(3, 10, 3);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let cfg = PipelineConfig {
            class_names: Some(vec!["water".into(), "forest".into(), "urban".into()]),
            ..config(10)
        };
        let out = Pipeline::new(&model, cfg).unwrap().run(cell_features(2), &catalog).unwrap();
        // Cell 1 has mean 1 → index 1.
        assert_eq!(labels(&out, "class"), vec![json!("water"), json!("forest")]);
    }

    #[test]
    fn numerical_classes_without_names() {
        let model = MeanModel::new(3, 10, 3);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let out = Pipeline::new(&model, config(10)).unwrap().run(cell_features(3), &catalog).unwrap();
        assert_eq!(labels(&out, "class")[2], json!(2));
    }

    #[test]
    fn class_name_count_mismatch_is_fatal_before_inference() {
        let model = MeanModel::new(3, 10, 3);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let cfg = PipelineConfig { class_names: Some(vec!["a".into(), "b".into()]), ..config(10) };
        let err = Pipeline::new(&model, cfg).unwrap().run(cell_features(3), &catalog).unwrap_err();
        assert!(matches!(err, PipelineError::ClassCountMismatch { expected: 3, actual: 2 }));
        assert_eq!(model.calls.get(), 0);
    }

    #[test]
    fn max_side_is_inclusive_end_to_end() {
        let model = MeanModel::new(1, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(1)]);
        let layer = VectorLayer {
            features: vec![
                Feature::for_test("eq", Some(rect_poly(0.0, 0.0, 12.0, 5.0)), json!({})),
                Feature::for_test("over", Some(rect_poly(0.0, 0.0, 13.0, 5.0)), json!({})),
            ],
            foreign_members: None,
        };
        let cfg = PipelineConfig { max_side_dim: Some(12), ..config(10) };
        let out = Pipeline::new(&model, cfg).unwrap().run(layer, &catalog).unwrap();
        assert_eq!(out.layer.features.len(), 1);
        assert_eq!(out.report.dropped.get(DropReason::TooLarge), 1);
    }

    #[test]
    fn cancelled_run_produces_no_output() {
        let model = MeanModel::new(3, 10, 20);
        let catalog = RasterCatalog::new(vec![striped_tile(3)]);
        let flag = Arc::new(AtomicBool::new(true));
        flag.store(true, Ordering::Relaxed);
        let err = Pipeline::new(&model, config(2))
            .unwrap()
            .with_cancel(flag)
            .run(cell_features(4), &catalog)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { batches: 0 }));
        assert_eq!(model.calls.get(), 0);
    }
}
