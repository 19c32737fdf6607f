use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid quality value '{0}'")]
pub struct QualityParseError(pub String);

/// Result of one quality measure, `NotTerminated` if the clustering never finished.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QualityValue {
    Value(f64),
    NotTerminated,
}

impl QualityValue {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(value) => Some(*value),
            Self::NotTerminated => None,
        }
    }
}

impl Display for QualityValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::NotTerminated => write!(f, "NT"),
        }
    }
}

impl FromStr for QualityValue {
    type Err = QualityParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "NT" => Ok(Self::NotTerminated),
            other => other
                .parse::<f64>()
                .map(Self::Value)
                .map_err(|_| QualityParseError(other.to_owned())),
        }
    }
}

/// Qualities of one clustering, keyed by measure name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QualitySet(BTreeMap<String, QualityValue>);

impl QualitySet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Every measure reported as not terminated.
    pub fn not_terminated<S: AsRef<str>>(measures: &[S]) -> Self {
        Self(
            measures
                .iter()
                .map(|m| (m.as_ref().to_owned(), QualityValue::NotTerminated))
                .collect(),
        )
    }

    pub fn insert(&mut self, measure: impl Into<String>, value: QualityValue) {
        self.0.insert(measure.into(), value);
    }

    pub fn get(&self, measure: &str) -> Option<QualityValue> {
        self.0.get(measure).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QualityValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_not_terminated(&self) -> bool {
        self.0.values().all(|value| !value.is_terminated())
    }
}

impl<K: Into<String>> FromIterator<(K, QualityValue)> for QualitySet {
    fn from_iter<T: IntoIterator<Item = (K, QualityValue)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QualityMeasureConfig {
    #[serde(default = "default_higher_is_better")]
    pub higher_is_better: bool,
}

fn default_higher_is_better() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityMeasure {
    pub name: String,
    pub higher_is_better: bool,
}

impl QualityMeasure {
    pub fn new(name: impl Into<String>, higher_is_better: bool) -> Self {
        Self {
            name: name.into(),
            higher_is_better,
        }
    }

    pub fn from_config(name: &str, config: &QualityMeasureConfig) -> Self {
        Self::new(name, config.higher_is_better)
    }

    /// Whether `first` beats `second`.
    ///
    /// A not terminated candidate never wins and anything beats a not
    /// terminated incumbent. NaN loses against every number.
    pub fn is_better_than(&self, first: QualityValue, second: QualityValue) -> bool {
        match (first, second) {
            (QualityValue::NotTerminated, _) => false,
            (_, QualityValue::NotTerminated) => true,
            (_, QualityValue::Value(b)) if b.is_nan() => true,
            (QualityValue::Value(a), _) if a.is_nan() => false,
            (QualityValue::Value(a), QualityValue::Value(b)) => {
                if self.higher_is_better {
                    a > b
                } else {
                    a < b
                }
            }
        }
    }
}
