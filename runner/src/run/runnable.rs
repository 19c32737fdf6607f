use super::{iteration::IterationRunnable, Run, RunError, RunMode};
use crate::{
    config::{DataConfig, ProgramConfig},
    executors::LocalExecutor,
    ingest::Ingestors,
    optimization::{registry, MethodSpec, OptimizationError, OptimizationMethod, OptimizationStatus},
    params::{NamedParameter, ParameterSet},
    quality::{QualityMeasure, QualitySet},
    repository::Repository,
    threading::{pool::TaskHandle, scheduler::RunScheduler},
};
use parking_lot::Mutex;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Everything the iterations of one (program, data) pair share.
#[derive(Debug)]
pub struct PairContext {
    pub run: String,
    pub program_name: String,
    pub data_name: String,
    pub program: ProgramConfig,
    pub data: DataConfig,
    pub measures: Vec<QualityMeasure>,
    pub ingestor: Ingestors,
    pub executor: Arc<LocalExecutor>,
    pub clusters: PathBuf,
    pub timeout: Option<Duration>,
    pub terminated: Arc<AtomicBool>,
    pub method: Option<Arc<OptimizationMethod>>,
    pub failed_iterations: AtomicU64,
}

impl PairContext {
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.program_name, self.data_name)
    }

    pub fn result_file(&self) -> PathBuf {
        self.clusters.join(format!("{}.results.qual.complete", self.prefix()))
    }

    pub fn not_terminated(&self) -> QualitySet {
        QualitySet::not_terminated(&self.measures.iter().map(|m| m.name.as_str()).collect::<Vec<_>>())
    }
}

#[derive(Debug, Default)]
struct PairState {
    issued: u64,
    finished: bool,
    failed: Option<String>,
}

/// Drives the optimization of one (program, data) pair of a run.
#[derive(Debug)]
pub struct RunRunnable {
    context: Arc<PairContext>,
    resume: bool,
    state: Mutex<PairState>,
}

impl RunRunnable {
    pub fn new(run: &Run, program_name: &str, data_name: &str, repository: &Repository) -> Result<Self, RunError> {
        let config = repository.config();
        let template = run.template();
        let unknown = |what: &str| RunError::Unknown(format!("{what} of run {}", run.ident()));

        let program = config
            .programs
            .get(program_name)
            .ok_or_else(|| unknown(program_name))?
            .clone();
        let data = config.data.get(data_name).ok_or_else(|| unknown(data_name))?.clone();
        let ingestor = repository
            .ingestor(&program.ingest)
            .ok_or_else(|| RunError::UnknownIngestor(program.ingest.clone()))?
            .clone();
        let measures = repository.measures(&template.measures(config));
        let timeout = template
            .file
            .max_execution_minutes
            .or(program.max_execution_minutes)
            .map(|minutes| Duration::from_secs(minutes * 60));

        let method = match (template.file.mode, template.file.optimization.as_ref()) {
            (RunMode::ParameterOptimization, Some(optimization)) => {
                let parameters = template
                    .optimized_parameters(config, program_name)
                    .into_iter()
                    .filter_map(|name| {
                        program
                            .parameters
                            .get(&name)
                            .map(|parameter| NamedParameter::new(name.clone(), parameter.clone()))
                    })
                    .collect();
                let criterion = measures
                    .iter()
                    .find(|measure| measure.name == optimization.criterion)
                    .cloned()
                    .ok_or_else(|| unknown(&optimization.criterion))?;

                let spec = MethodSpec {
                    run: run.ident().to_owned(),
                    program: program_name.to_owned(),
                    data: data_name.to_owned(),
                    data_path: data.path.clone(),
                    data_format: data.format,
                    parameters,
                    criterion,
                    measures: measures.clone(),
                    iterations: optimization.iterations,
                    resume: run.is_resume(),
                };

                Some(Arc::new(registry::create_method(
                    &optimization.method,
                    spec,
                    repository.numeric(),
                )?))
            }
            _ => None,
        };

        Ok(Self {
            context: Arc::new(PairContext {
                run: run.ident().to_owned(),
                program_name: program_name.to_owned(),
                data_name: data_name.to_owned(),
                program,
                data,
                measures,
                ingestor,
                executor: run.executor(),
                clusters: run.result_folder().join("clusters"),
                timeout,
                terminated: run.terminated_flag(),
                method,
                failed_iterations: AtomicU64::new(0),
            }),
            resume: run.is_resume(),
            state: Mutex::new(PairState::default()),
        })
    }

    pub fn context(&self) -> &Arc<PairContext> {
        &self.context
    }

    pub fn name(&self) -> String {
        self.context.prefix()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failed.clone()
    }

    /// Wake up a method waiting for feedback, called on termination.
    pub fn interrupt(&self) {
        if let Some(ref method) = self.context.method {
            method.interrupt();
        }
    }

    /// Finished share of the pair between 0 and 100.
    pub fn percent_finished(&self) -> f64 {
        if self.is_finished() {
            return 100.0;
        }

        match self.context.method {
            Some(ref method) => {
                let total = method.total_iteration_count();
                if total == 0 {
                    0.0
                } else {
                    (method.finished_count() as f64 / total as f64 * 100.0).min(100.0)
                }
            }
            None => 0.0,
        }
    }

    pub fn optimization_status(&self) -> Option<Result<OptimizationStatus, OptimizationError>> {
        self.context.method.as_ref().map(|method| method.status())
    }

    /// Execute the pair, failures end the pair but never the run.
    pub fn execute(&self, scheduler: &Arc<RunScheduler>) {
        let result = self.run(scheduler);
        let mut state = self.state.lock();

        match result {
            Ok(()) => {
                let failed = self.context.failed_iterations.load(Ordering::SeqCst);
                if state.issued > 0 && failed == state.issued {
                    state.failed = Some(format!("all {failed} iterations failed"));
                }
            }
            Err(error) => {
                error!(error = ?error, pair = self.name(), "Pair failed: {error}");
                state.failed = Some(error.to_string());
            }
        }

        state.finished = true;
    }

    fn submit(
        &self,
        scheduler: &Arc<RunScheduler>,
        iteration: u64,
        set: ParameterSet,
    ) -> Result<TaskHandle, RunError> {
        let runnable = IterationRunnable::new(self.context.clone(), iteration, set);
        let owner = scheduler.clone();
        self.state.lock().issued += 1;

        Ok(scheduler.register_iteration_runnable(move || runnable.execute(&owner))?)
    }

    fn run(&self, scheduler: &Arc<RunScheduler>) -> Result<(), RunError> {
        let context = &self.context;

        let Some(ref method) = context.method else {
            // a clustering run is a single iteration with the program defaults
            let handle = self.submit(scheduler, 1, ParameterSet::new())?;
            handle.wait();

            return Ok(());
        };

        method.reset(&context.result_file())?;
        method.write_header(self.resume)?;

        info!(
            pair = self.name(),
            total = method.total_iteration_count(),
            resumed = method.current_count(),
            "Starting parameter optimization"
        );

        let mut handles = Vec::new();
        let mut duplicates = Vec::new();
        let mut failure = None;

        while method.has_next() && !context.terminated.load(Ordering::SeqCst) {
            match method.next() {
                Ok(set) => {
                    let iteration = method.current_count();
                    debug!(iteration, "Submitting {set}");
                    handles.push(self.submit(scheduler, iteration, set)?);
                }
                Err(OptimizationError::AlreadyEvaluated {
                    iteration,
                    previous,
                    set,
                }) => {
                    debug!(iteration, previous, "Skipping already evaluated {set}");
                    duplicates.push((iteration, previous));
                }
                Err(OptimizationError::Interrupted) => break,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        for handle in handles {
            handle.wait();
        }

        // duplicate rows may only follow the row they refer to
        for (iteration, previous) in duplicates {
            method.record_duplicate(iteration, previous)?;
        }

        if let Some(error) = failure {
            return Err(error.into());
        }

        match method.status() {
            Ok(status) => {
                for (measure, (set, value)) in status.optimum.iter() {
                    info!(pair = self.name(), measure = measure, "Optimum {value} at {set}");
                }
            }
            Err(error) => warn!(error = ?error, "Failed to summarize optimization: {error}"),
        }
        method.unload_from_memory();

        Ok(())
    }
}
