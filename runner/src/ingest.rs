pub mod exec;

use crate::{
    config::{ConfigErrors, IngestorConfig},
    quality::{QualityMeasure, QualitySet, QualityValue},
};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Failed to spawn ingestor")]
    SpawnIngestor(std::io::Error),
    #[error("Failed to deserialize ingestor output")]
    DeserializeIngestor(#[from] serde_yaml::Error),
    #[error("Failed to wait for a child proccess")]
    ChildError(#[from] std::io::Error),
    #[error("Ingestor timeout")]
    ChildTimeout,
}

#[derive(Debug, Clone, Default)]
/// container for information extracted from running a program
/// supposed to be interpreted by ingestors
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: Option<i32>,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

pub type IngestorMap = BTreeMap<String, Ingestors>;

#[derive(Clone, Debug)]
pub enum Ingestors {
    Exec(exec::ExecIngestor),
    Null,
}

impl Ingestors {
    pub fn load(config: &IngestorConfig) -> Result<Self, ConfigErrors> {
        match config {
            IngestorConfig::Null => Ok(Self::Null),
            IngestorConfig::Exec { .. } => exec::ExecIngestor::load(config).map(Ingestors::Exec),
        }
    }

    /// load, if possible, all ingestors
    pub fn load_all(configs: &BTreeMap<String, IngestorConfig>) -> Result<IngestorMap, ConfigErrors> {
        let mut ingestors = IngestorMap::new();
        let mut contains_error = false;

        for (name, config) in configs.iter() {
            match Self::load(config) {
                Ok(ingestor) => {
                    ingestors.insert(name.clone(), ingestor);
                }
                Err(e) => {
                    error!("ingestor {name} failed to load: {e}");
                    contains_error = true;
                }
            };
        }

        if contains_error {
            Err(ConfigErrors::FailedLoadIngestor)
        } else {
            Ok(ingestors)
        }
    }

    #[tracing::instrument(level = "debug", skip(output), fields(runtime = ?output.runtime))]
    pub fn ingest(&self, output: &RunOutput, measures: &[QualityMeasure]) -> Result<QualitySet, IngestorError> {
        match self {
            Self::Exec(ingestor) => ingestor.ingest(output, measures),
            Self::Null => parse_qualities(&output.stdout, measures).map_err(|error| {
                error!(error = ?error, "Failed to deserialize qualities for null ingestor");
                error
            }),
        }
    }
}

/// Read a YAML map `measure: value` into a quality set over `measures`.
///
/// Measures missing from the output are not terminated, unknown ones are ignored.
pub fn parse_qualities(input: &str, measures: &[QualityMeasure]) -> Result<QualitySet, IngestorError> {
    let values: BTreeMap<String, serde_yaml::Value> = if input.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_yaml::from_str(input)?
    };

    let mut qualities = QualitySet::new();

    for measure in measures {
        let value = match values.get(&measure.name) {
            Some(serde_yaml::Value::Number(number)) => number
                .as_f64()
                .map_or(QualityValue::NotTerminated, QualityValue::Value),
            Some(serde_yaml::Value::String(text)) => match text.parse() {
                Ok(value) => value,
                Err(e) => {
                    warn!(measure = measure.name, "{e}, recording NT");
                    QualityValue::NotTerminated
                }
            },
            Some(other) => {
                warn!(measure = measure.name, value = ?other, "Unsupported quality value, recording NT");
                QualityValue::NotTerminated
            }
            None => QualityValue::NotTerminated,
        };

        qualities.insert(measure.name.clone(), value);
    }

    Ok(qualities)
}
