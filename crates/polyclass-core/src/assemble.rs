//! Attach resolved class labels to surviving features.
//!
//! One output feature per prediction, in prediction order, carrying the
//! original geometry, id and properties plus the label. Nothing is reordered,
//! merged or deduplicated.

use geojson::JsonValue;

use crate::classes::ClassSpace;
use crate::error::{PipelineError, PipelineResult};
use crate::scheduler::Prediction;
use crate::vector::Feature;

pub struct ClassificationAssembler<'a> {
    space: &'a ClassSpace,
    class_property: &'a str,
    confidence_property: Option<&'a str>,
    out: Vec<geojson::Feature>,
}

impl<'a> ClassificationAssembler<'a> {
    pub fn new(space: &'a ClassSpace, class_property: &'a str) -> Self {
        Self {
            space,
            class_property,
            confidence_property: None,
            out: Vec::new(),
        }
    }

    /// Also write the winning class probability under `property`.
    pub fn with_confidence(mut self, property: Option<&'a str>) -> Self {
        self.confidence_property = property;
        self
    }

    pub fn push(&mut self, feature: &Feature, prediction: &Prediction) -> PipelineResult<()> {
        if prediction.feature_id != feature.id {
            return Err(PipelineError::PredictionMismatch {
                feature: feature.id.clone(),
                prediction: prediction.feature_id.clone(),
            });
        }
        let label = self.space.resolve(prediction.class_index)?;

        let mut extra = vec![(self.class_property.to_string(), label.to_json())];
        if let (Some(key), Some(conf)) = (self.confidence_property, prediction.confidence) {
            extra.push((key.to_string(), JsonValue::from(f64::from(conf))));
        }
        self.out.push(feature.to_geojson_with(extra));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn finish(self) -> Vec<geojson::Feature> {
        self.out
    }
}

/// Pair two equally long, identically ordered sequences.
pub fn assemble(
    space: &ClassSpace,
    class_property: &str,
    features: &[Feature],
    predictions: &[Prediction],
) -> PipelineResult<Vec<geojson::Feature>> {
    if features.len() != predictions.len() {
        return Err(PipelineError::PredictionCount {
            features: features.len(),
            predictions: predictions.len(),
        });
    }
    let mut asm = ClassificationAssembler::new(space, class_property);
    for (feature, prediction) in features.iter().zip(predictions) {
        asm.push(feature, prediction)?;
    }
    Ok(asm.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FeatureId;
    use serde_json::json;

    fn feature(id: &str) -> Feature {
        Feature::for_test(id, None, json!({"source": "survey", "image_id": "scene"}))
    }

    fn prediction(id: &str, class_index: usize) -> Prediction {
        Prediction { feature_id: FeatureId::from(id), class_index, confidence: Some(0.75) }
    }

    #[test]
    fn named_labels_replace_indices() {
        let space = ClassSpace::Named(vec!["water".into(), "forest".into(), "urban".into()]);
        let out = assemble(&space, "class", &[feature("a")], &[prediction("a", 1)]).unwrap();
        let props = out[0].properties.as_ref().unwrap();
        assert_eq!(props["class"], json!("forest"));
        assert_eq!(props["source"], json!("survey"));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn numerical_labels_stay_numeric() {
        let space = ClassSpace::Numerical { count: 3 };
        let out = assemble(&space, "class", &[feature("a")], &[prediction("a", 2)]).unwrap();
        assert_eq!(out[0].properties.as_ref().unwrap()["class"], json!(2));
    }

    #[test]
    fn order_and_count_are_preserved() {
        let space = ClassSpace::Numerical { count: 3 };
        let features = [feature("x"), feature("y"), feature("z")];
        let preds = [prediction("x", 0), prediction("y", 2), prediction("z", 1)];
        let out = assemble(&space, "label", &features, &preds).unwrap();
        let labels: Vec<_> = out.iter().map(|f| f.properties.as_ref().unwrap()["label"].clone()).collect();
        assert_eq!(labels, vec![json!(0), json!(2), json!(1)]);
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let space = ClassSpace::Numerical { count: 3 };
        assert!(matches!(
            assemble(&space, "class", &[feature("a")], &[]),
            Err(PipelineError::PredictionCount { features: 1, predictions: 0 })
        ));
        assert!(matches!(
            assemble(&space, "class", &[feature("a")], &[prediction("b", 0)]),
            Err(PipelineError::PredictionMismatch { .. })
        ));
    }

    #[test]
    fn index_beyond_names_is_fatal() {
        let space = ClassSpace::Named(vec!["water".into()]);
        let err = assemble(&space, "class", &[feature("a")], &[prediction("a", 1)]).unwrap_err();
        assert!(matches!(err, PipelineError::ClassIndexOutOfRange { index: 1, len: 1 }));
    }

    #[test]
    fn confidence_is_optional_output() {
        let space = ClassSpace::Numerical { count: 2 };
        let mut asm = ClassificationAssembler::new(&space, "class").with_confidence(Some("certainty"));
        asm.push(&feature("a"), &prediction("a", 1)).unwrap();
        let out = asm.finish();
        assert_eq!(out[0].properties.as_ref().unwrap()["certainty"], json!(0.75));
    }
}
