use geojson::JsonValue;
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};

/// How a model's numeric output index is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassSpace {
    /// Raw index; `count` is the model's output width.
    Numerical { count: usize },
    /// Index into an ordered name list as long as the model's output width.
    Named(Vec<String>),
}

/// Resolved label written onto an output feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClassLabel {
    Index(usize),
    Name(String),
}

impl ClassLabel {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ClassLabel::Index(i) => JsonValue::from(*i),
            ClassLabel::Name(n) => JsonValue::from(n.as_str()),
        }
    }
}

impl ClassSpace {
    /// Named when class names are supplied, numerical otherwise. A name list
    /// whose length differs from the model's output width is a configuration
    /// error.
    pub fn from_names(names: Option<Vec<String>>, model_classes: usize) -> PipelineResult<Self> {
        match names {
            None => Ok(ClassSpace::Numerical { count: model_classes }),
            Some(names) if names.len() == model_classes => Ok(ClassSpace::Named(names)),
            Some(names) => Err(PipelineError::ClassCountMismatch {
                expected: model_classes,
                actual: names.len(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ClassSpace::Numerical { count } => *count,
            ClassSpace::Named(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, index: usize) -> PipelineResult<ClassLabel> {
        match self {
            ClassSpace::Numerical { count } if index < *count => Ok(ClassLabel::Index(index)),
            ClassSpace::Named(names) if index < names.len() => Ok(ClassLabel::Name(names[index].clone())),
            _ => Err(PipelineError::ClassIndexOutOfRange { index, len: self.len() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Option<Vec<String>> {
        Some(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn named_lookup() {
        let space = ClassSpace::from_names(names(&["water", "forest", "urban"]), 3).unwrap();
        assert_eq!(space.resolve(1).unwrap(), ClassLabel::Name("forest".into()));
        assert_eq!(space.resolve(1).unwrap().to_json(), json!("forest"));
    }

    #[test]
    fn numerical_passthrough() {
        let space = ClassSpace::from_names(None, 3).unwrap();
        assert_eq!(space.resolve(2).unwrap().to_json(), json!(2));
    }

    #[test]
    fn name_count_must_match_model_width() {
        let err = ClassSpace::from_names(names(&["a", "b"]), 3).unwrap_err();
        assert!(err.is_configuration());
        assert!(ClassSpace::from_names(Some(Vec::new()), 2).is_err());
    }

    #[test]
    fn out_of_range_index_is_fatal() {
        let space = ClassSpace::Named(vec!["a".into(), "b".into()]);
        match space.resolve(2) {
            Err(PipelineError::ClassIndexOutOfRange { index, len }) => assert_eq!((index, len), (2, 2)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
