use crate::{
    params::ParameterSet,
    quality::{QualityMeasure, QualitySet, QualityValue},
};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access result file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed result file {path:?} at line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("result store is not loaded into memory")]
    NotLoaded,
}

/// One persisted iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationRecord {
    pub iteration: u64,
    pub parameter_set: ParameterSet,
    pub qualities: Option<QualitySet>,
    /// Set if the iteration re-evaluated the set of an earlier iteration.
    pub duplicate_of: Option<u64>,
}

#[derive(Debug, Default, Clone)]
struct StoreData {
    // distinct sets in order of their first evaluation
    parameter_sets: Vec<ParameterSet>,
    iterations: BTreeMap<u64, ParameterSet>,
    first_iteration: HashMap<ParameterSet, u64>,
    qualities: HashMap<ParameterSet, QualitySet>,
    optimum: BTreeMap<String, (ParameterSet, QualityValue)>,
}

/// Results of one optimization method, bound to its complete file.
///
/// The in-memory part can be dropped with [`unload_from_memory`] and
/// rebuilt from disk with [`load_into_memory`].
///
/// [`unload_from_memory`]: OptimizationResultStore::unload_from_memory
/// [`load_into_memory`]: OptimizationResultStore::load_into_memory
#[derive(Debug, Clone)]
pub struct OptimizationResultStore {
    path: PathBuf,
    parameters: Vec<String>,
    measures: Vec<QualityMeasure>,
    data: Option<StoreData>,
}

impl OptimizationResultStore {
    pub fn new(path: PathBuf, parameters: Vec<String>, measures: Vec<QualityMeasure>) -> Self {
        Self {
            path,
            parameters,
            measures,
            data: Some(StoreData::default()),
        }
    }

    /// Parse a complete file into a fresh, loaded store.
    pub fn parse(
        path: &Path,
        parameters: Vec<String>,
        measures: Vec<QualityMeasure>,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            path: path.to_path_buf(),
            parameters,
            measures,
            data: None,
        };
        store.load_into_memory()?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn measures(&self) -> &[QualityMeasure] {
        &self.measures
    }

    pub fn is_in_memory(&self) -> bool {
        self.data.is_some()
    }

    pub fn unload_from_memory(&mut self) {
        debug!(path = ?self.path, "Unloading optimization results from memory");
        self.data = None;
    }

    pub fn load_into_memory(&mut self) -> Result<(), StoreError> {
        if self.data.is_some() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut data = StoreData::default();
        let mut header: Option<(Vec<String>, Vec<String>)> = None;
        // duplicate rows may precede the row of the iteration they refer to
        let mut aliases = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_number = index + 1;

            if line.trim().is_empty() {
                continue;
            }

            let malformed = |reason: String| StoreError::Malformed {
                path: self.path.clone(),
                line: line_number,
                reason,
            };

            let columns = line.split('\t').collect_vec();

            let Some((parameters, measures)) = header.as_ref() else {
                if columns.len() < 2 || columns[0] != "iteration" {
                    return Err(malformed("missing header".to_owned()));
                }
                let parameters = if columns[1].is_empty() {
                    Vec::new()
                } else {
                    columns[1].split(',').map(str::to_owned).collect_vec()
                };
                if parameters.iter().sorted().ne(self.parameters.iter().sorted()) {
                    return Err(malformed(format!(
                        "parameters {parameters:?} do not match {:?}",
                        self.parameters
                    )));
                }
                let measures = columns[2..].iter().map(|m| m.to_string()).collect_vec();
                header = Some((parameters, measures));
                continue;
            };

            if let Some(iteration) = columns[0].strip_suffix('*') {
                // re-evaluation of an earlier iteration
                let iteration = iteration
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("invalid iteration: {e}")))?;
                let previous = columns
                    .get(1)
                    .ok_or_else(|| malformed("missing previous iteration".to_owned()))?
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("invalid previous iteration: {e}")))?;
                aliases.push((line_number, iteration, previous));
                continue;
            }

            if columns.len() != measures.len() + 2 {
                return Err(malformed(format!(
                    "expected {} columns, found {}",
                    measures.len() + 2,
                    columns.len()
                )));
            }

            let iteration = columns[0]
                .parse::<u64>()
                .map_err(|e| malformed(format!("invalid iteration: {e}")))?;
            let set = ParameterSet::from_joined(parameters, columns[1])
                .ok_or_else(|| malformed("parameter values do not match header".to_owned()))?;
            let qualities = measures
                .iter()
                .zip(columns[2..].iter())
                .map(|(measure, value)| {
                    value
                        .parse::<QualityValue>()
                        .map(|value| (measure.clone(), value))
                        .map_err(|e| malformed(e.to_string()))
                })
                .collect::<Result<QualitySet, StoreError>>()?;

            Self::register_in(&mut data, iteration, set.clone());
            Self::put_quality_in(&self.measures, &mut data, &set, qualities);
        }

        for (line, iteration, previous) in aliases {
            let set = data.iterations.get(&previous).cloned().ok_or_else(|| StoreError::Malformed {
                path: self.path.clone(),
                line,
                reason: format!("unknown previous iteration {previous}"),
            })?;
            data.iterations.insert(iteration, set);
        }

        match header {
            // appended lines have to follow the column order of the file
            Some((parameters, _)) => self.parameters = parameters,
            None => warn!(path = ?self.path, "Result file is empty"),
        }

        self.data = Some(data);

        Ok(())
    }

    fn data(&self) -> Result<&StoreData, StoreError> {
        self.data.as_ref().ok_or(StoreError::NotLoaded)
    }

    fn data_mut(&mut self) -> Result<&mut StoreData, StoreError> {
        self.data.as_mut().ok_or(StoreError::NotLoaded)
    }

    fn register_in(data: &mut StoreData, iteration: u64, set: ParameterSet) -> Option<u64> {
        match data.first_iteration.get(&set) {
            Some(first) => {
                let first = *first;
                data.iterations.insert(iteration, set);
                Some(first)
            }
            None => {
                data.first_iteration.insert(set.clone(), iteration);
                data.parameter_sets.push(set.clone());
                data.iterations.insert(iteration, set);
                None
            }
        }
    }

    fn put_quality_in(
        measures: &[QualityMeasure],
        data: &mut StoreData,
        set: &ParameterSet,
        qualities: QualitySet,
    ) -> bool {
        for measure in measures {
            let Some(value) = qualities.get(&measure.name) else {
                continue;
            };

            let replace = match data.optimum.get(&measure.name) {
                None => true,
                Some((_, current)) => measure.is_better_than(value, *current),
            };

            if replace {
                data.optimum
                    .insert(measure.name.clone(), (set.clone(), value));
            }
        }

        data.qualities.insert(set.clone(), qualities).is_none()
    }

    /// Register `set` under `iteration`.
    ///
    /// Returns the first iteration of the set if it was evaluated before, the
    /// number of distinct sets is unchanged in that case.
    pub fn register(&mut self, iteration: u64, set: ParameterSet) -> Result<Option<u64>, StoreError> {
        Ok(Self::register_in(self.data_mut()?, iteration, set))
    }

    /// Record qualities, returns true the first time a set receives feedback.
    pub fn put_quality(&mut self, set: &ParameterSet, qualities: QualitySet) -> Result<bool, StoreError> {
        let measures = self.measures.clone();
        Ok(Self::put_quality_in(&measures, self.data_mut()?, set, qualities))
    }

    pub fn iteration_for(&self, set: &ParameterSet) -> Result<Option<u64>, StoreError> {
        Ok(self.data()?.first_iteration.get(set).copied())
    }

    pub fn parameter_set(&self, iteration: u64) -> Result<Option<&ParameterSet>, StoreError> {
        Ok(self.data()?.iterations.get(&iteration))
    }

    pub fn first_parameter_set(&self) -> Result<Option<&ParameterSet>, StoreError> {
        Ok(self.data()?.parameter_sets.first())
    }

    pub fn quality(&self, set: &ParameterSet) -> Result<Option<&QualitySet>, StoreError> {
        Ok(self.data()?.qualities.get(set))
    }

    pub fn optimum(&self, measure: &str) -> Result<Option<(&ParameterSet, QualityValue)>, StoreError> {
        Ok(self
            .data()?
            .optimum
            .get(measure)
            .map(|(set, value)| (set, *value)))
    }

    /// Number of distinct evaluated parameter sets.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.data()?.parameter_sets.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn parameter_sets(&self) -> Result<&[ParameterSet], StoreError> {
        Ok(&self.data()?.parameter_sets)
    }

    pub fn iteration_mapping(&self) -> Result<&BTreeMap<u64, ParameterSet>, StoreError> {
        Ok(&self.data()?.iterations)
    }

    /// All iterations in ascending order.
    pub fn records(&self) -> Result<Vec<IterationRecord>, StoreError> {
        let data = self.data()?;

        Ok(data
            .iterations
            .iter()
            .map(|(iteration, set)| {
                let first = data.first_iteration.get(set).copied();
                IterationRecord {
                    iteration: *iteration,
                    parameter_set: set.clone(),
                    qualities: data.qualities.get(set).cloned(),
                    duplicate_of: first.filter(|first| first != iteration),
                }
            })
            .collect())
    }

    pub fn header_line(&self) -> String {
        format!(
            "iteration\t{}\t{}",
            self.parameters.join(","),
            self.measures.iter().map(|m| m.name.as_str()).join("\t")
        )
    }

    pub fn record_line(&self, iteration: u64, set: &ParameterSet, qualities: &QualitySet) -> String {
        format!(
            "{iteration}\t{}\t{}",
            set.values_joined(&self.parameters),
            self.measures
                .iter()
                .map(|m| qualities
                    .get(&m.name)
                    .unwrap_or(QualityValue::NotTerminated)
                    .to_string())
                .join("\t")
        )
    }

    pub fn duplicate_line(iteration: u64, previous: u64) -> String {
        format!("{iteration}*\t{previous}")
    }

    /// Truncate the complete file and write the header.
    pub fn write_header(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path)?;
        writeln!(file, "{}", self.header_line())?;

        Ok(())
    }

    pub fn append_line(&self, line: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        writeln!(file, "{line}")?;

        Ok(())
    }
}
