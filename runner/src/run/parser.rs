use super::RunMode;
use crate::{config::BackendConfig, optimization::registry};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read run file {path}: {error}")]
    Io { path: PathBuf, error: std::io::Error },
    #[error("Failed to deserialize run file {path}: {error}")]
    Yaml { path: PathBuf, error: serde_yaml::Error },
    #[error("Run {run} lists no {what}")]
    Empty { run: String, what: &'static str },
    #[error("Run {run} references unknown program {program}")]
    UnknownProgram { run: String, program: String },
    #[error("Run {run} references unknown data {data}")]
    UnknownData { run: String, data: String },
    #[error("Run {run} references unknown quality measure {measure}")]
    UnknownMeasure { run: String, measure: String },
    #[error("Run {run}: program {program} has no parameter {parameter}")]
    UnknownParameter {
        run: String,
        program: String,
        parameter: String,
    },
    #[error("Run {run} is a parameter optimization run without an optimization section")]
    MissingOptimization { run: String },
    #[error("Run {run}: '{method}' is not one of {known:?}")]
    UnknownMethod {
        run: String,
        method: String,
        known: Vec<&'static str>,
    },
    #[error("Run {run}: the optimization criterion {criterion} is not a selected quality measure")]
    InvalidCriterion { run: String, criterion: String },
    #[error("Run {run} requires at least one iteration")]
    NoIterations { run: String },
    #[error("Run {run}: program {program} cannot read the {format:?} format of data {data}")]
    IncompatibleFormat {
        run: String,
        program: String,
        data: String,
        format: crate::config::DataFormat,
    },
}

/// Content of a `.run` file.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    pub mode: RunMode,
    pub programs: Vec<String>,
    pub data: Vec<String>,
    // defaults to every configured measure
    #[serde(default)]
    pub quality_measures: Vec<String>,
    pub optimization: Option<OptimizationFile>,
    // overrides the programs' own limit
    pub max_execution_minutes: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OptimizationFile {
    pub method: String,
    pub criterion: String,
    pub iterations: usize,
    // program -> optimized parameters, all parameters of a program if missing
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<String>>,
}

/// A parsed and validated run, the blueprint every scheduled `Run` is cloned from.
#[derive(Clone, Debug)]
pub struct RunTemplate {
    pub name: String,
    pub source: PathBuf,
    pub modified: Option<SystemTime>,
    pub file: RunFile,
}

impl RunTemplate {
    /// Quality measures of the run in evaluation order.
    pub fn measures(&self, config: &BackendConfig) -> Vec<String> {
        if self.file.quality_measures.is_empty() {
            config.quality_measures.keys().cloned().collect()
        } else {
            self.file.quality_measures.clone()
        }
    }

    /// Parameters of `program` this run optimizes.
    pub fn optimized_parameters(&self, config: &BackendConfig, program: &str) -> Vec<String> {
        match self.file.optimization {
            Some(ref optimization) => match optimization.parameters.get(program) {
                Some(parameters) => parameters.clone(),
                None => config
                    .programs
                    .get(program)
                    .map(|program| program.parameters.keys().cloned().collect())
                    .unwrap_or_default(),
            },
            None => Vec::new(),
        }
    }
}

pub fn run_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read and validate the run file at `path`.
pub fn parse_run(path: &Path, config: &BackendConfig) -> Result<RunTemplate, ParseError> {
    let contents = fs::read_to_string(path).map_err(|error| ParseError::Io {
        path: path.to_path_buf(),
        error,
    })?;
    let file: RunFile = serde_yaml::from_str(&contents).map_err(|error| ParseError::Yaml {
        path: path.to_path_buf(),
        error,
    })?;

    let template = RunTemplate {
        name: run_name(path),
        source: path.to_path_buf(),
        modified: fs::metadata(path).and_then(|meta| meta.modified()).ok(),
        file,
    };
    validate(&template, config)?;

    debug!(run = template.name, mode = ?template.file.mode, "Parsed run");

    Ok(template)
}

pub fn validate(template: &RunTemplate, config: &BackendConfig) -> Result<(), ParseError> {
    let run = || template.name.clone();
    let file = &template.file;

    if file.programs.is_empty() {
        return Err(ParseError::Empty { run: run(), what: "programs" });
    }
    if file.data.is_empty() {
        return Err(ParseError::Empty { run: run(), what: "data" });
    }

    for program in file.programs.iter() {
        if !config.programs.contains_key(program) {
            return Err(ParseError::UnknownProgram {
                run: run(),
                program: program.clone(),
            });
        }
    }

    for data in file.data.iter() {
        let Some(data_config) = config.data.get(data) else {
            return Err(ParseError::UnknownData {
                run: run(),
                data: data.clone(),
            });
        };

        for program in file.programs.iter() {
            if let Some(program_config) = config.programs.get(program) {
                if !program_config.formats.contains(&data_config.format) {
                    return Err(ParseError::IncompatibleFormat {
                        run: run(),
                        program: program.clone(),
                        data: data.clone(),
                        format: data_config.format,
                    });
                }
            }
        }
    }

    let measures = template.measures(config);
    for measure in measures.iter() {
        if !config.quality_measures.contains_key(measure) {
            return Err(ParseError::UnknownMeasure {
                run: run(),
                measure: measure.clone(),
            });
        }
    }

    if file.mode == RunMode::ParameterOptimization {
        let Some(ref optimization) = file.optimization else {
            return Err(ParseError::MissingOptimization { run: run() });
        };

        if !registry::is_known(&optimization.method) {
            return Err(ParseError::UnknownMethod {
                run: run(),
                method: optimization.method.clone(),
                known: registry::strategy_names(),
            });
        }

        if !measures.contains(&optimization.criterion) {
            return Err(ParseError::InvalidCriterion {
                run: run(),
                criterion: optimization.criterion.clone(),
            });
        }

        if optimization.iterations == 0 {
            return Err(ParseError::NoIterations { run: run() });
        }

        for (program, parameters) in optimization.parameters.iter() {
            let Some(program_config) = config.programs.get(program) else {
                return Err(ParseError::UnknownProgram {
                    run: run(),
                    program: program.clone(),
                });
            };

            for parameter in parameters {
                if !program_config.parameters.contains_key(parameter) {
                    return Err(ParseError::UnknownParameter {
                        run: run(),
                        program: program.clone(),
                        parameter: parameter.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}
