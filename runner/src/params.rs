use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("parameter {0} has an empty range ({1} > {2})")]
    EmptyRange(String, String, String),
    #[error("parameter {0} is a string parameter without options")]
    MissingOptions(String),
    #[error("parameter {0} has a non finite bound")]
    NonFinite(String),
}

/// One point in the parameter space, keyed by parameter name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, String>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Restrict the set to the given names, dropping everything else.
    pub fn restrict<S: AsRef<str>>(&self, names: &[S]) -> Self {
        Self(
            names
                .iter()
                .filter_map(|name| {
                    self.0
                        .get_key_value(name.as_ref())
                        .map(|(key, value)| (key.clone(), value.clone()))
                })
                .collect(),
        )
    }

    /// Merge `other` into a copy of `self`, values of `other` take precedence.
    pub fn merged(&self, other: &ParameterSet) -> Self {
        let mut result = self.clone();
        result
            .0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        result
    }

    /// Values in the order of `names`, joined as they are written to result files.
    pub fn values_joined<S: AsRef<str>>(&self, names: &[S]) -> String {
        names
            .iter()
            .map(|name| self.get(name.as_ref()).unwrap_or(""))
            .join(",")
    }

    /// Inverse of [`ParameterSet::values_joined`].
    pub fn from_joined<S: AsRef<str>>(names: &[S], values: &str) -> Option<Self> {
        let values = if names.is_empty() {
            Vec::new()
        } else {
            values.split(',').collect_vec()
        };

        if values.len() != names.len() {
            return None;
        }

        Some(Self(
            names
                .iter()
                .zip(values)
                .map(|(name, value)| (name.as_ref().to_owned(), value.to_owned()))
                .collect(),
        ))
    }
}

impl Display for ParameterSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{}}}",
            self.0.iter().map(|(k, v)| format!("{k}={v}")).join(", ")
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A typed program parameter as declared in a program configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ProgramParameter {
    Double {
        min: f64,
        max: f64,
        default: f64,
        #[serde(default)]
        options: Vec<f64>,
    },
    Integer {
        min: i64,
        max: i64,
        default: i64,
        #[serde(default)]
        options: Vec<i64>,
    },
    String {
        #[serde(default)]
        options: Vec<String>,
        default: String,
    },
}

impl ProgramParameter {
    pub fn default_value(&self) -> String {
        match self {
            Self::Double { default, .. } => format_double(*default),
            Self::Integer { default, .. } => default.to_string(),
            Self::String { default, .. } => default.clone(),
        }
    }

    /// Explicit option list, `None` if the parameter is a range.
    pub fn options(&self) -> Option<Vec<String>> {
        let options = match self {
            Self::Double { options, .. } => options.iter().map(|o| format_double(*o)).collect_vec(),
            Self::Integer { options, .. } => options.iter().map(|o| o.to_string()).collect_vec(),
            Self::String { options, .. } => options.clone(),
        };

        if options.is_empty() {
            None
        } else {
            Some(options)
        }
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Double { min, max, .. } => Some((*min, *max)),
            Self::Integer { min, max, .. } => Some((*min as f64, *max as f64)),
            Self::String { .. } => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::String { .. })
    }

    /// Copy of this parameter with its range replaced, integer bounds are rounded.
    pub fn with_bounds(&self, new_min: f64, new_max: f64) -> Self {
        match self.clone() {
            Self::Double {
                default, options, ..
            } => Self::Double {
                min: new_min,
                max: new_max,
                default,
                options,
            },
            Self::Integer {
                default, options, ..
            } => Self::Integer {
                min: new_min.round() as i64,
                max: new_max.round() as i64,
                default,
                options,
            },
            other => other,
        }
    }

    /// Grid of `count` values over the parameter's range. A non-empty option
    /// list replaces the range, numeric parameters included.
    pub fn grid(&self, count: usize) -> Vec<String> {
        if let Some(options) = self.options() {
            return options;
        }

        match self {
            Self::Double { min, max, .. } => double_range(*min, *max, count)
                .into_iter()
                .map(format_double)
                .collect(),
            Self::Integer { min, max, .. } => integer_range(*min, *max, count)
                .into_iter()
                .map(|v| v.to_string())
                .collect(),
            Self::String { .. } => Vec::new(),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ParameterError> {
        match self {
            Self::Double { min, max, .. } => {
                if !min.is_finite() || !max.is_finite() {
                    Err(ParameterError::NonFinite(name.to_owned()))
                } else if min > max {
                    Err(ParameterError::EmptyRange(
                        name.to_owned(),
                        min.to_string(),
                        max.to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            Self::Integer { min, max, .. } if min > max => Err(ParameterError::EmptyRange(
                name.to_owned(),
                min.to_string(),
                max.to_string(),
            )),
            Self::String { options, .. } if options.is_empty() => {
                Err(ParameterError::MissingOptions(name.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

/// Evenly spaced values over `[min, max]`, both ends included.
pub fn double_range(min: f64, max: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (count - 1) as f64;
            (0..count)
                .map(|i| {
                    if i == count - 1 {
                        max
                    } else {
                        min + step * i as f64
                    }
                })
                .collect()
        }
    }
}

/// Rounded evenly spaced integers, duplicates after rounding are removed.
pub fn integer_range(min: i64, max: i64, count: usize) -> Vec<i64> {
    double_range(min as f64, max as f64, count)
        .into_iter()
        .map(|value| value.round() as i64)
        .dedup()
        .collect()
}

pub fn format_double(value: f64) -> String {
    format!("{value}")
}

/// A parameter together with the name it is optimized under.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedParameter {
    pub name: String,
    pub parameter: ProgramParameter,
}

impl NamedParameter {
    pub fn new(name: impl Into<String>, parameter: ProgramParameter) -> Self {
        Self {
            name: name.into(),
            parameter,
        }
    }
}
