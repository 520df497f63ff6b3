//! Memory-bounded batched inference.
//!
//! The scheduler pulls `(feature, chip)` pairs from a lazy source until it
//! holds `chips_in_mem` chips or the source runs dry, classifies the buffer in
//! one call, releases the chips and repeats. Chips are only produced as fast
//! as the buffer has room, so at most `chips_in_mem` are ever resident.
//! Predictions come out in input order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::chip::Chip;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{argmax, Classifier};
use crate::vector::{Feature, FeatureId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub feature_id: FeatureId,
    pub class_index: usize,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub batches: usize,
    pub chips: usize,
    /// Largest buffer handed to the classifier.
    pub peak_resident: usize,
}

pub struct BatchScheduler<'m, C: Classifier + ?Sized> {
    model: &'m C,
    chips_in_mem: usize,
    cancel: Option<Arc<AtomicBool>>,
    stats: SchedulerStats,
}

impl<'m, C: Classifier + ?Sized> BatchScheduler<'m, C> {
    pub fn new(model: &'m C, chips_in_mem: usize) -> PipelineResult<Self> {
        if chips_in_mem == 0 {
            return Err(PipelineError::InvalidConfig("chips_in_mem must be at least 1".into()));
        }
        Ok(Self {
            model,
            chips_in_mem,
            cancel: None,
            stats: SchedulerStats::default(),
        })
    }

    /// Stop before the next batch once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn capacity(&self) -> usize {
        self.chips_in_mem
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Classify one buffer. Chips are consumed and dropped on return.
    pub fn classify_batch(&mut self, batch: Vec<(Feature, Chip)>) -> PipelineResult<Vec<(Feature, Prediction)>> {
        let index = self.stats.batches;
        if self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(PipelineError::Cancelled { batches: index });
        }
        if batch.len() > self.chips_in_mem {
            return Err(PipelineError::InvalidConfig(format!(
                "batch of {} exceeds chips_in_mem {}",
                batch.len(),
                self.chips_in_mem
            )));
        }

        let (features, chips): (Vec<Feature>, Vec<Chip>) = batch.into_iter().unzip();
        self.stats.peak_resident = self.stats.peak_resident.max(chips.len());

        let dists = self
            .model
            .classify(&chips)
            .map_err(|source| PipelineError::Inference { batch: index, source })?;
        drop(chips);

        if dists.len() != features.len() {
            return Err(PipelineError::Inference {
                batch: index,
                source: format!("classifier returned {} results for {} chips", dists.len(), features.len()).into(),
            });
        }

        let width = self.model.num_classes();
        let mut out = Vec::with_capacity(features.len());
        for (feature, dist) in features.into_iter().zip(dists) {
            if dist.len() != width {
                return Err(PipelineError::Inference {
                    batch: index,
                    source: format!("distribution of width {} for a {width}-class model", dist.len()).into(),
                });
            }
            let (class_index, confidence) = argmax(&dist).ok_or_else(|| PipelineError::Inference {
                batch: index,
                source: "classifier returned an empty or all-NaN distribution".into(),
            })?;
            let prediction = Prediction {
                feature_id: feature.id.clone(),
                class_index,
                confidence: Some(confidence),
            };
            out.push((feature, prediction));
        }

        self.stats.batches += 1;
        self.stats.chips += out.len();
        info!("batch {index}: classified {} chips", out.len());
        Ok(out)
    }

    /// Lazily batch a `(feature, chip)` source.
    pub fn run<I>(&mut self, items: I) -> Batches<'_, 'm, C, I::IntoIter>
    where
        I: IntoIterator<Item = (Feature, Chip)>,
    {
        Batches { scheduler: self, items: items.into_iter(), done: false }
    }
}

/// Iterator of classified batches; stops after the first error.
pub struct Batches<'s, 'm, C: Classifier + ?Sized, I> {
    scheduler: &'s mut BatchScheduler<'m, C>,
    items: I,
    done: bool,
}

impl<C, I> Iterator for Batches<'_, '_, C, I>
where
    C: Classifier + ?Sized,
    I: Iterator<Item = (Feature, Chip)>,
{
    type Item = PipelineResult<Vec<(Feature, Prediction)>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let buffer: Vec<(Feature, Chip)> = self.items.by_ref().take(self.scheduler.chips_in_mem).collect();
        if buffer.is_empty() {
            self.done = true;
            return None;
        }
        let result = self.scheduler.classify_batch(buffer);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
