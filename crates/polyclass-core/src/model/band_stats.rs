//! Lightweight bundled backend: multinomial logistic regression over the
//! per-band mean and standard deviation of the normalised chip.
//!
//! Model file (JSON), one weight row and one bias per class:
//!
//! ```text
//! { "input_shape": [bands, side, side],
//!   "weights": [[w_mean_0, w_std_0, w_mean_1, w_std_1, ...], ...],
//!   "bias": [b_0, b_1, ...] }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Classifier, InputShape};
use crate::chip::Chip;
use crate::error::{BoxError, PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandStatsModel {
    pub input_shape: [usize; 3],
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl BandStatsModel {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&text)?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let [bands, h, w] = self.input_shape;
        if bands == 0 || h == 0 {
            return Err(PipelineError::Model(format!("degenerate input shape {:?}", self.input_shape)));
        }
        if h != w {
            return Err(PipelineError::Model(format!("input must be square, got {h}x{w}")));
        }
        if self.weights.is_empty() {
            return Err(PipelineError::Model("model has no classes".into()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(PipelineError::Model(format!(
                "{} bias terms for {} classes",
                self.bias.len(),
                self.weights.len()
            )));
        }
        if let Some(row) = self.weights.iter().position(|r| r.len() != 2 * bands) {
            return Err(PipelineError::Model(format!(
                "weight row {row} has {} entries, expected {}",
                self.weights[row].len(),
                2 * bands
            )));
        }
        Ok(())
    }

    fn features(chip: &Chip) -> Vec<f32> {
        let max = chip.max_value();
        let n = (chip.side * chip.side) as f32;
        let mut out = Vec::with_capacity(2 * chip.bands);
        for b in 0..chip.bands {
            let band = chip.band(b);
            let mean = band.iter().map(|v| v / max).sum::<f32>() / n;
            let var = band.iter().map(|v| (v / max - mean).powi(2)).sum::<f32>() / n;
            out.push(mean);
            out.push(var.sqrt());
        }
        out
    }

    fn softmax(logits: &[f32]) -> Vec<f32> {
        let peak = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - peak).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }
}

impl Classifier for BandStatsModel {
    fn input_shape(&self) -> InputShape {
        InputShape::new(self.input_shape[0], self.input_shape[1])
    }

    fn num_classes(&self) -> usize {
        self.weights.len()
    }

    fn classify(&self, batch: &[Chip]) -> Result<Vec<Vec<f32>>, BoxError> {
        let expected = self.input_shape().dims();
        batch
            .iter()
            .map(|chip| -> Result<Vec<f32>, BoxError> {
                if chip.shape() != expected {
                    return Err(format!("chip shape {:?} does not match model input {:?}", chip.shape(), expected).into());
                }
                let f = Self::features(chip);
                let logits: Vec<f32> = self
                    .weights
                    .iter()
                    .zip(&self.bias)
                    .map(|(row, b)| row.iter().zip(&f).map(|(w, x)| w * x).sum::<f32>() + b)
                    .collect();
                Ok(Self::softmax(&logits))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Two classes on one band: "dark" wins for low means, "bright" for high.
    fn dark_bright() -> BandStatsModel {
        BandStatsModel {
            input_shape: [1, 2, 2],
            weights: vec![vec![-10.0, 0.0], vec![10.0, 0.0]],
            bias: vec![5.0, -5.0],
        }
    }

    fn chip(value: f32) -> Chip {
        Chip { bands: 1, side: 2, bit_depth: 8, data: vec![value; 4] }
    }

    #[test]
    fn distributions_sum_to_one_and_separate_classes() {
        let m = dark_bright();
        let out = m.classify(&[chip(0.0), chip(255.0)]).unwrap();
        assert_eq!(out.len(), 2);
        for dist in &out {
            assert_relative_eq!(dist.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        }
        assert!(out[0][0] > 0.99);
        assert!(out[1][1] > 0.99);
    }

    #[test]
    fn wrong_chip_shape_is_an_error() {
        let m = dark_bright();
        let bad = Chip { bands: 3, side: 2, bit_depth: 8, data: vec![0.0; 12] };
        assert!(m.classify(&[bad]).is_err());
    }

    #[test]
    fn validation_catches_inconsistent_files() {
        let mut m = dark_bright();
        assert!(m.validate().is_ok());
        m.bias.pop();
        assert!(m.validate().is_err());

        let mut m = dark_bright();
        m.input_shape = [1, 2, 3];
        assert!(m.validate().is_err());

        let mut m = dark_bright();
        m.weights[1].push(1.0);
        assert!(m.validate().is_err());
    }

    #[test]
    fn parses_model_json() {
        let m: BandStatsModel = serde_json::from_str(
            r#"{"input_shape": [3, 64, 64], "weights": [[0,0,0,0,0,0],[1,1,1,1,1,1]], "bias": [0, 0]}"#,
        )
        .unwrap();
        assert!(m.validate().is_ok());
        assert_eq!(m.input_shape(), InputShape::new(3, 64));
        assert_eq!(m.num_classes(), 2);
    }
}
