use crate::{numeric::NumericConfig, params::ProgramParameter, quality::QualityMeasureConfig};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read configuration: {0}")]
    Unreadable(std::io::Error),
    #[error("Failed to deserialize configuration: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Ingestor failed to load")]
    FailedLoadIngestor,
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[cfg(feature = "sqlite")]
    #[error("Database failed")]
    DatabaseError(#[from] crate::database::ConnectionError),
}

/// Coordinate system of a data set.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// one object per row, one coordinate per column
    #[default]
    Absolute,
    /// pairwise similarities
    Relative,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    // repository root, contains `runs/` and `results/`
    pub repository: PathBuf,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    // clustering programs as generic executables with an argument template
    pub programs: BTreeMap<String, ProgramConfig>,
    pub data: BTreeMap<String, DataConfig>,
    pub quality_measures: BTreeMap<String, QualityMeasureConfig>,
    // Config for all ingestor related setups
    #[serde(default)]
    pub ingest: BTreeMap<String, IngestorConfig>,

    #[serde(alias = "db")]
    pub database: Option<DatabaseConfig>,
    pub numeric: Option<NumericConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // size of the iteration pool, defaults to the number of cores
    pub threads: Option<usize>,
    // size of the run pool
    #[serde(default = "default_run_threads")]
    pub run_threads: usize,
    // pin iteration workers to cores
    #[serde(default)]
    pub pin_workers: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: None,
            run_threads: default_run_threads(),
            pin_workers: false,
        }
    }
}

impl ExecutorConfig {
    pub fn iteration_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

/// Sleep times are given in milliseconds.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_sleep")]
    pub sleep: u64,
    pub scheduler_sleep: Option<u64>,
    pub finder_sleep: Option<u64>,
    // scan the repository once and stop afterwards
    #[serde(default)]
    pub check_once: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sleep: default_supervisor_sleep(),
            scheduler_sleep: None,
            finder_sleep: None,
            check_once: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum IngestorConfig {
    /// stdout of the program is the YAML map of qualities
    #[serde(alias = "stdout")]
    Null,
    /// stdout of the program is piped into `exec`, which prints the YAML map
    Exec {
        exec: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        // milliseconds
        #[serde(default = "default_ingest_timeout")]
        timeout: u64,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub exec: PathBuf,
    // argument template, see `executors::substitute`
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ProgramParameter>,
    pub max_execution_minutes: Option<u64>,
    pub ingest: String,
    // data formats the program understands
    #[serde(default = "default_formats")]
    pub formats: Vec<DataFormat>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: DataFormat,
    pub goldstandard: Option<PathBuf>,
}

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::Unreadable)?;
        let config: Self = serde_yaml::from_reader(file)?;

        info!(path = ?path, programs = config.programs.len(), data = config.data.len(), "Loaded configuration");

        Ok(config)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.repository.join("runs")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.repository.join("results")
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.programs.is_empty() {
            error!("No program was defined, unable to build any run");
            contains_error = true;
        }

        if self.quality_measures.is_empty() {
            error!("No quality measure was defined, iterations could not be compared");
            contains_error = true;
        }

        if self.executor.run_threads == 0 || self.executor.threads == Some(0) {
            error!("executor.threads and executor.run_threads must be at least 1");
            contains_error = true;
        }

        if !self.repository.is_dir() {
            error!(
                "repository {} is not a directory",
                self.repository.to_string_lossy()
            );
            contains_error = true;
        }

        for (name, config) in self.ingest.iter() {
            if let IngestorConfig::Exec { exec, .. } = config {
                if !matches!(check_executable(exec), Ok(true)) {
                    error!("ingest.{name}.exec must be a valid path to an executable file");
                    contains_error = true;
                }
            }
        }
        let supported_ingestors = self.ingest.keys().sorted().cloned().collect_vec();

        for (name, program) in self.programs.iter() {
            if supported_ingestors.binary_search(&program.ingest).is_err() {
                error!(
                    "programs.{name}.ingest '{}' is not defined in ingest",
                    program.ingest
                );
                contains_error = true;
            }

            match check_executable(&program.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Program {name} target {} is not executable",
                        program.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if programs.{name}.exec ({}) is an executable: {e}",
                        program.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            for (parameter, value) in program.parameters.iter() {
                if let Err(e) = value.validate(parameter) {
                    error!("programs.{name}.parameters.{parameter}: {e}");
                    contains_error = true;
                }
            }

            if program.max_execution_minutes == Some(0) {
                error!("programs.{name}.max_execution_minutes cannot be 0, every iteration would time out");
                contains_error = true;
            }
        }

        for (name, data) in self.data.iter() {
            if !data.path.is_file() {
                error!(
                    "Failed to find data.{name}.path at {}",
                    data.path.to_string_lossy()
                );
                contains_error = true;
            }

            if let Some(ref goldstandard) = data.goldstandard {
                if !goldstandard.is_file() {
                    warn!(
                        "data.{name}.goldstandard {} does not exist, external measures will be NT",
                        goldstandard.to_string_lossy()
                    );
                }
            }
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("clusteval.db")
}

fn default_run_threads() -> usize {
    5
}

fn default_supervisor_sleep() -> u64 {
    5000
}

fn default_ingest_timeout() -> u64 {
    2000
}

fn default_formats() -> Vec<DataFormat> {
    vec![DataFormat::Absolute, DataFormat::Relative]
}
