//! Classifier boundary.
//!
//! The pipeline only needs the model's fixed input shape, its output width,
//! and a batch call returning one class distribution per chip in batch order.
//! Any inference backend can sit behind [`Classifier`].

pub mod band_stats;

pub use band_stats::BandStatsModel;

use crate::chip::Chip;
use crate::error::BoxError;

/// Fixed model input `[bands, side, side]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub bands: usize,
    pub side: usize,
}

impl InputShape {
    pub fn new(bands: usize, side: usize) -> Self {
        Self { bands, side }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.bands, self.side, self.side]
    }
}

pub trait Classifier {
    fn input_shape(&self) -> InputShape;

    /// Width of each returned distribution.
    fn num_classes(&self) -> usize;

    /// Class distributions for `batch`, same length and order.
    fn classify(&self, batch: &[Chip]) -> Result<Vec<Vec<f32>>, BoxError>;
}

impl<C: Classifier + ?Sized> Classifier for &C {
    fn input_shape(&self) -> InputShape {
        (**self).input_shape()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn classify(&self, batch: &[Chip]) -> Result<Vec<Vec<f32>>, BoxError> {
        (**self).classify(batch)
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn input_shape(&self) -> InputShape {
        (**self).input_shape()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn classify(&self, batch: &[Chip]) -> Result<Vec<Vec<f32>>, BoxError> {
        (**self).classify(batch)
    }
}

/// Index and value of the largest entry. NaNs never win.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_first_of_ties_and_skips_nan() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[0.5, 0.5]), Some((0, 0.5)));
        assert_eq!(argmax(&[f32::NAN, 0.3]), Some((1, 0.3)));
        assert_eq!(argmax(&[]), None);
    }
}
