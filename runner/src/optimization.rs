pub mod diverging;
pub mod divisive;
pub mod gap_statistic;
pub mod layered;
pub mod registry;
pub mod store;

#[cfg(test)]
mod method_test;

use crate::{
    config::DataFormat,
    numeric::NumericError,
    params::{NamedParameter, ParameterSet},
    quality::{QualityMeasure, QualitySet, QualityValue},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use store::{OptimizationResultStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("parameter set {set} was already evaluated in iteration {previous} (requested as iteration {iteration})")]
    AlreadyEvaluated {
        iteration: u64,
        previous: u64,
        set: ParameterSet,
    },
    #[error("no parameter set could be found: {0}")]
    NoParameterSetFound(String),
    #[error("reset has not been called for this optimization method")]
    NotReset,
    #[error("{pending} parameter sets are still awaiting feedback")]
    AwaitingFeedback { pending: usize },
    #[error("optimization was interrupted")]
    Interrupted,
    #[error("failed to replay previous results: {0}")]
    Replay(String),
    #[error("'{0}' is not a known parameter optimization method")]
    UnknownMethod(String),
    #[error("incompatible configuration: {0}")]
    Incompatible(String),
    #[error("numeric backend failed: {0}")]
    Numeric(#[from] NumericError),
    #[error("result store failed: {0}")]
    Store(#[from] StoreError),
}

/// Everything a method needs to know about the pairing it optimizes.
#[derive(Clone, Debug)]
pub struct MethodSpec {
    pub run: String,
    pub program: String,
    pub data: String,
    pub data_path: PathBuf,
    pub data_format: DataFormat,
    pub parameters: Vec<NamedParameter>,
    pub criterion: QualityMeasure,
    pub measures: Vec<QualityMeasure>,
    pub iterations: usize,
    pub resume: bool,
}

impl MethodSpec {
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }
}

/// Policy deciding which parameter set is evaluated next.
pub trait OptimizationStrategy: Debug + Send {
    /// Prepare value ranges, called on every reset.
    fn init_parameter_values(&mut self, spec: &MethodSpec) -> Result<(), OptimizationError>;

    fn has_next(&self) -> bool;

    /// Produce the next set. A forced set still advances the internal
    /// position and is returned as is.
    fn next_parameter_set(
        &mut self,
        forced: Option<&ParameterSet>,
        store: &OptimizationResultStore,
        spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError>;

    fn total_iteration_count(&self) -> usize;

    /// True if the next step may only be taken once every issued set received feedback.
    fn awaits_complete_feedback(&self) -> bool {
        false
    }

    fn on_feedback(&mut self, _set: &ParameterSet, _qualities: &QualitySet) {}

    fn on_not_terminated(&mut self, set: &ParameterSet, qualities: &QualitySet) {
        self.on_feedback(set, qualities)
    }

    /// Whether not terminated iterations change the search.
    fn is_diverging(&self) -> bool {
        false
    }
}

/// Lock protected state of one optimization method.
#[derive(Debug)]
pub struct MethodState {
    strategy: Box<dyn OptimizationStrategy>,
    store: Option<OptimizationResultStore>,
    current_count: u64,
    finished_count: u64,
    resume: bool,
}

impl MethodState {
    pub fn new(strategy: Box<dyn OptimizationStrategy>, resume: bool) -> Self {
        Self {
            strategy,
            store: None,
            current_count: 0,
            finished_count: 0,
            resume,
        }
    }

    fn store(&self) -> Result<&OptimizationResultStore, OptimizationError> {
        self.store.as_ref().ok_or(OptimizationError::NotReset)
    }

    fn store_mut(&mut self) -> Result<&mut OptimizationResultStore, OptimizationError> {
        self.store.as_mut().ok_or(OptimizationError::NotReset)
    }

    pub fn reset(&mut self, spec: &MethodSpec, result_file: &Path) -> Result<(), OptimizationError> {
        self.current_count = 0;
        self.finished_count = 0;
        self.strategy.init_parameter_values(spec)?;
        self.store = Some(OptimizationResultStore::new(
            result_file.to_path_buf(),
            spec.parameter_names(),
            spec.measures.clone(),
        ));

        if self.resume {
            self.replay(spec, result_file)?;
            self.resume = false;
        }

        Ok(())
    }

    fn replay(&mut self, spec: &MethodSpec, result_file: &Path) -> Result<(), OptimizationError> {
        let previous = OptimizationResultStore::parse(
            result_file,
            spec.parameter_names(),
            spec.measures.clone(),
        )
        .map_err(|error| OptimizationError::Replay(error.to_string()))?;

        let records = previous.records()?;
        info!(
            records = records.len(),
            "Replaying previous results of {}/{}", spec.program, spec.data
        );

        for record in records {
            let set = match self.next_forced(spec, &record.parameter_set, record.iteration) {
                Ok(set) | Err(OptimizationError::AlreadyEvaluated { set, .. }) => set,
                Err(error) => return Err(OptimizationError::Replay(error.to_string())),
            };

            if let Some(qualities) = record.qualities {
                if qualities.all_not_terminated() && self.strategy.is_diverging() {
                    self.give_feedback_not_terminated(&set, qualities)?;
                } else {
                    self.give_quality_feedback(&set, qualities)?;
                }
            }
        }

        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.strategy.has_next()
    }

    /// Advance one step.
    pub fn next(&mut self, spec: &MethodSpec) -> Result<ParameterSet, OptimizationError> {
        let store = self.store.as_ref().ok_or(OptimizationError::NotReset)?;
        let set = self.strategy.next_parameter_set(None, store, spec)?;
        self.current_count += 1;
        let iteration = self.current_count;

        match self.store_mut()?.register(iteration, set.clone())? {
            None => {
                trace!(iteration, "Issued {set}");
                Ok(set)
            }
            Some(previous) => {
                if let Some(qualities) = self.store()?.quality(&set)?.cloned() {
                    self.give_quality_feedback(&set, qualities)?;
                }

                Err(OptimizationError::AlreadyEvaluated {
                    iteration,
                    previous,
                    set,
                })
            }
        }
    }

    /// Advance to exactly `iteration` with a predetermined set.
    ///
    /// Iterations skipped on the way are filled with the first stored set and
    /// its recorded qualities.
    pub fn next_forced(
        &mut self,
        spec: &MethodSpec,
        forced: &ParameterSet,
        iteration: u64,
    ) -> Result<ParameterSet, OptimizationError> {
        if iteration <= self.current_count {
            return Err(OptimizationError::Replay(format!(
                "iteration {iteration} does not follow iteration {}",
                self.current_count
            )));
        }

        let gap = iteration - self.current_count;
        if let Some(first) = self.store()?.first_parameter_set()?.cloned() {
            for _ in 1..gap {
                let qualities = self.store()?.quality(&first)?.cloned();
                let next_iteration = self.current_count + 1;
                let set = self.next_forced(spec, &first, next_iteration)?;

                if let Some(qualities) = qualities {
                    self.give_quality_feedback(&set, qualities)?;
                }
            }
        }

        let store = self.store.as_ref().ok_or(OptimizationError::NotReset)?;
        let set = self.strategy.next_parameter_set(Some(forced), store, spec)?;
        self.store_mut()?.register(iteration, set.clone())?;
        self.current_count = iteration;

        Ok(set)
    }

    pub fn give_quality_feedback(
        &mut self,
        set: &ParameterSet,
        qualities: QualitySet,
    ) -> Result<(), OptimizationError> {
        if self.store_mut()?.put_quality(set, qualities.clone())? {
            self.finished_count += 1;
        }
        self.strategy.on_feedback(set, &qualities);

        Ok(())
    }

    pub fn give_feedback_not_terminated(
        &mut self,
        set: &ParameterSet,
        qualities: QualitySet,
    ) -> Result<(), OptimizationError> {
        if self.store_mut()?.put_quality(set, qualities.clone())? {
            self.finished_count += 1;
        }
        self.strategy.on_not_terminated(set, &qualities);

        Ok(())
    }

    pub fn total_iteration_count(&self) -> usize {
        self.strategy.total_iteration_count()
    }

    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    pub fn finished_count(&self) -> u64 {
        self.finished_count
    }

    pub fn result_store(&self) -> Option<&OptimizationResultStore> {
        self.store.as_ref()
    }

    /// Distinct sets that were issued but have no feedback yet.
    fn pending(&self) -> Result<usize, OptimizationError> {
        let store = self.store()?;
        let mut pending = 0;

        for set in store.parameter_sets()? {
            if store.quality(set)?.is_none() {
                pending += 1;
            }
        }

        Ok(pending)
    }
}

/// Progress and best results of one method.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationStatus {
    pub started: u64,
    pub finished: u64,
    pub total: usize,
    pub optimum: BTreeMap<String, (ParameterSet, QualityValue)>,
}

impl OptimizationStatus {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.finished as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

/// Thread safe optimization method of one (program, data) pairing.
///
/// Iteration threads report feedback concurrently with the run thread asking
/// for the next set, the layer barrier waits on `feedback`.
#[derive(Debug)]
pub struct OptimizationMethod {
    spec: MethodSpec,
    state: Mutex<MethodState>,
    feedback: Condvar,
    interrupted: AtomicBool,
    max_pending: Option<usize>,
}

impl OptimizationMethod {
    pub fn new(spec: MethodSpec, strategy: Box<dyn OptimizationStrategy>) -> Self {
        let resume = spec.resume;

        Self {
            spec,
            state: Mutex::new(MethodState::new(strategy, resume)),
            feedback: Condvar::new(),
            interrupted: AtomicBool::new(false),
            max_pending: None,
        }
    }

    /// Refuse to issue new sets while `max_pending` sets still await feedback.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    pub fn spec(&self) -> &MethodSpec {
        &self.spec
    }

    #[instrument(skip(self), fields(program = %self.spec.program, data = %self.spec.data))]
    pub fn reset(&self, result_file: &Path) -> Result<(), OptimizationError> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.state.lock().reset(&self.spec, result_file)
    }

    pub fn has_next(&self) -> bool {
        self.state.lock().has_next()
    }

    pub fn next(&self) -> Result<ParameterSet, OptimizationError> {
        let mut state = self.state.lock();

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(OptimizationError::Interrupted);
            }

            let pending = state.pending()?;

            if let Some(max_pending) = self.max_pending {
                if pending >= max_pending {
                    return Err(OptimizationError::AwaitingFeedback { pending });
                }
            }

            if pending > 0 && state.strategy.awaits_complete_feedback() {
                debug!(pending, "Waiting for the current layer to finish");
                self.feedback
                    .wait_for(&mut state, Duration::from_secs(1));
                continue;
            }

            break;
        }

        state.next(&self.spec)
    }

    pub fn next_forced(&self, forced: &ParameterSet, iteration: u64) -> Result<ParameterSet, OptimizationError> {
        self.state.lock().next_forced(&self.spec, forced, iteration)
    }

    pub fn give_quality_feedback(&self, set: &ParameterSet, qualities: QualitySet) -> Result<(), OptimizationError> {
        let result = self.state.lock().give_quality_feedback(set, qualities);
        self.feedback.notify_all();
        result
    }

    pub fn give_feedback_not_terminated(
        &self,
        set: &ParameterSet,
        qualities: QualitySet,
    ) -> Result<(), OptimizationError> {
        let result = self.state.lock().give_feedback_not_terminated(set, qualities);
        self.feedback.notify_all();
        result
    }

    pub fn is_diverging(&self) -> bool {
        self.state.lock().strategy.is_diverging()
    }

    /// Wake up and fail every caller blocked in [`OptimizationMethod::next`].
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.feedback.notify_all();
    }

    pub fn total_iteration_count(&self) -> usize {
        self.state.lock().total_iteration_count()
    }

    pub fn current_count(&self) -> u64 {
        self.state.lock().current_count()
    }

    pub fn finished_count(&self) -> u64 {
        self.state.lock().finished_count()
    }

    pub fn iteration_mapping(&self) -> Result<BTreeMap<u64, ParameterSet>, OptimizationError> {
        Ok(self.state.lock().store()?.iteration_mapping()?.clone())
    }

    pub fn result_file(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .result_store()
            .map(|store| store.path().to_path_buf())
    }

    /// Write the header unless a resumed run appends to an existing file.
    pub fn write_header(&self, resume: bool) -> Result<(), OptimizationError> {
        let state = self.state.lock();
        let store = state.store()?;

        if !resume || !store.path().exists() {
            store.write_header()?;
        }

        Ok(())
    }

    pub fn record_iteration(
        &self,
        iteration: u64,
        set: &ParameterSet,
        qualities: &QualitySet,
    ) -> Result<(), OptimizationError> {
        let state = self.state.lock();
        let store = state.store()?;
        store.append_line(&store.record_line(iteration, set, qualities))?;

        Ok(())
    }

    /// Append the duplicate row of `iteration`, returns false if `previous`
    /// never received feedback and therefore has no row to refer to.
    pub fn record_duplicate(&self, iteration: u64, previous: u64) -> Result<bool, OptimizationError> {
        let state = self.state.lock();
        let store = state.store()?;

        let recorded = match store.parameter_set(previous)? {
            Some(set) => store.quality(set)?.is_some(),
            None => false,
        };
        if !recorded {
            debug!(iteration, previous, "Skipping duplicate of an unrecorded iteration");
            return Ok(false);
        }

        store.append_line(&OptimizationResultStore::duplicate_line(iteration, previous))?;

        Ok(true)
    }

    pub fn unload_from_memory(&self) {
        if let Some(store) = self.state.lock().store.as_mut() {
            store.unload_from_memory();
        }
    }

    /// Snapshot of counters and best sets, the store is read from disk if it was unloaded.
    pub fn status(&self) -> Result<OptimizationStatus, OptimizationError> {
        let mut state = self.state.lock();
        let started = state.current_count;
        let finished = state.finished_count;
        let total = state.total_iteration_count();
        let store = state.store_mut()?;

        let unload = !store.is_in_memory();
        if unload {
            warn!(path = ?store.path(), "Loading unloaded results for a status request");
            store.load_into_memory()?;
        }

        let mut optimum = BTreeMap::new();
        for measure in store.measures() {
            if let Some((set, value)) = store.optimum(&measure.name)? {
                optimum.insert(measure.name.clone(), (set.clone(), value));
            }
        }

        if unload {
            store.unload_from_memory();
        }

        Ok(OptimizationStatus {
            started,
            finished,
            total,
            optimum,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_spec(parameters: Vec<NamedParameter>, iterations: usize) -> MethodSpec {
    MethodSpec {
        run: "test_run".to_owned(),
        program: "program".to_owned(),
        data: "data".to_owned(),
        data_path: PathBuf::from("data.tsv"),
        data_format: DataFormat::Absolute,
        parameters,
        criterion: QualityMeasure::new("F1", true),
        measures: vec![QualityMeasure::new("F1", true), QualityMeasure::new("Runtime", false)],
        iterations,
        resume: false,
    }
}
