pub mod iteration;
pub mod parser;
pub mod runnable;

#[cfg(test)]
#[path = "run_test.rs"]
mod run_test;

use crate::{
    executors::{ExecutorError, LocalExecutor},
    ingest::IngestorError,
    optimization::{OptimizationError, OptimizationStatus},
    repository::Repository,
    threading::{pool::PoolError, scheduler::RunScheduler},
};
use chrono::{DateTime, Local};
use globset::Glob;
use ignore::WalkBuilder;
use itertools::iproduct;
use parking_lot::{Condvar, Mutex, RwLock};
use parser::{parse_run, ParseError, RunTemplate};
use runnable::RunRunnable;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to prepare {path}: {error}")]
    Folder { path: PathBuf, error: std::io::Error },
    #[error("Result {0} contains no run file")]
    MissingRunFile(PathBuf),
    #[error("Unknown {0}")]
    Unknown(String),
    #[error("Ingestor {0} is not configured")]
    UnknownIngestor(String),
    #[error("Run {0} has no executable pair")]
    NoPairs(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Optimization(#[from] OptimizationError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Ingestor(#[from] IngestorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum RunStatus {
    Inactive = 0,
    Scheduled = 1,
    Running = 2,
    Finished = 3,
    Error = 4,
    Terminated = 5,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Terminated)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl TryFrom<u8> for RunStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Inactive),
            1 => Ok(Self::Scheduled),
            2 => Ok(Self::Running),
            3 => Ok(Self::Finished),
            4 => Ok(Self::Error),
            5 => Ok(Self::Terminated),
            other => Err(other),
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Terminated => "TERMINATED",
        };

        write!(f, "{name}")
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Clustering,
    ParameterOptimization,
}

/// `<MM_dd_yyyy-HH_mm_ss>_<name>`
pub fn run_ident(name: &str, time: &DateTime<Local>) -> String {
    format!("{}_{name}", time.format("%m_%d_%Y-%H_%M_%S"))
}

/// One execution of a run template.
#[derive(Debug)]
pub struct Run {
    ident: String,
    client: String,
    template: Arc<RunTemplate>,
    resume: bool,
    result_folder: PathBuf,
    status: RwLock<RunStatus>,
    runnables: RwLock<Vec<Arc<RunRunnable>>>,
    executor: Arc<LocalExecutor>,
    terminated: Arc<AtomicBool>,
    stopped: Mutex<bool>,
    stop: Condvar,
}

impl Run {
    fn new(ident: String, client: &str, template: Arc<RunTemplate>, resume: bool, results: &Path) -> Self {
        Self {
            result_folder: results.join(&ident),
            ident,
            client: client.to_owned(),
            template,
            resume,
            status: RwLock::new(RunStatus::Inactive),
            runnables: RwLock::new(Vec::new()),
            executor: Arc::new(LocalExecutor::new()),
            terminated: Arc::new(AtomicBool::new(false)),
            stopped: Mutex::new(false),
            stop: Condvar::new(),
        }
    }

    /// Fresh run cloned from `template`, identified by the current time.
    pub fn from_template(template: Arc<RunTemplate>, client: &str, repository: &Repository) -> Self {
        let ident = run_ident(&template.name, &Local::now());

        Self::new(ident, client, template, false, &repository.config().results_dir())
    }

    /// Rebuild a run from its result folder, the run file copied into
    /// `configs/` is parsed again.
    pub fn from_result(result_id: &str, client: &str, repository: &Repository) -> Result<Self, RunError> {
        let configs = repository.result_folder(result_id).join("configs");
        let matcher = Glob::new("*.run")
            .map_err(|_| RunError::MissingRunFile(configs.clone()))?
            .compile_matcher();

        let run_file = WalkBuilder::new(&configs)
            .max_depth(Some(1))
            .standard_filters(false)
            .build()
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .find(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .map_or(false, |name| matcher.is_match(name))
            })
            .ok_or_else(|| RunError::MissingRunFile(configs.clone()))?;

        let template = parse_run(&run_file, repository.config())?;
        debug!(result = result_id, run = template.name, "Rebuilt run for resume");

        Ok(Self::new(
            result_id.to_owned(),
            client,
            Arc::new(template),
            true,
            &repository.config().results_dir(),
        ))
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn template(&self) -> &RunTemplate {
        &self.template
    }

    pub fn is_resume(&self) -> bool {
        self.resume
    }

    pub fn result_folder(&self) -> &Path {
        &self.result_folder
    }

    pub fn executor(&self) -> Arc<LocalExecutor> {
        self.executor.clone()
    }

    pub fn terminated_flag(&self) -> Arc<AtomicBool> {
        self.terminated.clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read()
    }

    pub fn runnables(&self) -> Vec<Arc<RunRunnable>> {
        self.runnables.read().clone()
    }

    pub fn set_status(&self, status: RunStatus, repository: &Repository) {
        *self.status.write() = status;
        self.announce(status, repository);
    }

    fn announce(&self, status: RunStatus, repository: &Repository) {
        info!(run = self.ident, client = self.client, "Run is {status}");
        repository.record_status(&self.ident, &self.client, self.resume, status);
    }

    /// 100 unless the run is running, the mean over all pairs otherwise.
    pub fn percent_finished(&self) -> f64 {
        if self.status() != RunStatus::Running {
            return 100.0;
        }

        let runnables = self.runnables.read();
        if runnables.is_empty() {
            return 0.0;
        }

        runnables.iter().map(|runnable| runnable.percent_finished()).sum::<f64>() / runnables.len() as f64
    }

    /// Optimization progress per pair.
    pub fn optimization_status(&self) -> BTreeMap<String, OptimizationStatus> {
        self.runnables
            .read()
            .iter()
            .filter_map(|runnable| match runnable.optimization_status()? {
                Ok(status) => Some((runnable.name(), status)),
                Err(error) => {
                    warn!(error = ?error, pair = runnable.name(), "No optimization status: {error}");
                    None
                }
            })
            .collect()
    }

    fn prepare_folder(&self) -> Result<(), RunError> {
        for folder in ["configs", "clusters", "logs"] {
            let path = self.result_folder.join(folder);
            fs::create_dir_all(&path).map_err(|error| RunError::Folder { path, error })?;
        }

        if !self.resume {
            let path = self
                .result_folder
                .join("configs")
                .join(format!("{}.run", self.template.name));
            fs::copy(&self.template.source, &path).map_err(|error| RunError::Folder { path, error })?;
        }

        Ok(())
    }

    /// Execute every pair of the run on the run pool and wait for them.
    #[instrument(skip_all, fields(run = %self.ident))]
    pub fn perform(self: &Arc<Self>, scheduler: &Arc<RunScheduler>) -> Result<(), RunError> {
        let result = self.execute(scheduler);
        let repository = scheduler.repository();

        let status = match result {
            _ if self.terminated.load(Ordering::SeqCst) => RunStatus::Terminated,
            Ok(()) => {
                let runnables = self.runnables.read();
                if runnables.iter().all(|runnable| runnable.failure().is_some()) {
                    RunStatus::Error
                } else {
                    RunStatus::Finished
                }
            }
            Err(ref error) => {
                error!(error = ?error, "Run failed: {error}");
                RunStatus::Error
            }
        };
        self.set_status(status, repository);

        *self.stopped.lock() = true;
        self.stop.notify_all();

        result
    }

    /// Continue a run from its result folder.
    pub fn resume(self: &Arc<Self>, scheduler: &Arc<RunScheduler>) -> Result<(), RunError> {
        if !self.resume {
            warn!(run = self.ident, "Resuming a run that was not loaded from results");
        }

        self.perform(scheduler)
    }

    fn execute(self: &Arc<Self>, scheduler: &Arc<RunScheduler>) -> Result<(), RunError> {
        let repository = scheduler.repository();
        {
            // checked under the status lock, a concurrent termination either sees RUNNING or wins
            let mut status = self.status.write();
            if self.terminated.load(Ordering::SeqCst) {
                return Ok(());
            }
            *status = RunStatus::Running;
        }
        self.announce(RunStatus::Running, repository);
        self.prepare_folder()?;

        let file = &self.template.file;
        let mut runnables = Vec::new();

        for (program, data) in iproduct!(file.programs.iter(), file.data.iter()) {
            match RunRunnable::new(self, program, data, repository) {
                Ok(runnable) => runnables.push(Arc::new(runnable)),
                // incompatible pairs are skipped, the rest of the run continues
                Err(error) => error!(error = ?error, program = program, data = data, "Skipping pair: {error}"),
            }
        }

        if runnables.is_empty() {
            return Err(RunError::NoPairs(self.ident.clone()));
        }

        *self.runnables.write() = runnables.clone();

        let mut handles = Vec::new();
        for runnable in runnables {
            let owner = scheduler.clone();
            handles.push(scheduler.register_run_runnable(move || runnable.execute(&owner))?);
        }

        for handle in handles {
            handle.wait();
        }

        Ok(())
    }

    /// Flag the run as terminated and kill its programs without waiting.
    ///
    /// Returns the status the run had, `None` if it was already terminal or terminated.
    pub fn request_termination(&self, repository: &Repository) -> Option<RunStatus> {
        let status = {
            let mut current = self.status.write();
            let status = *current;
            if status.is_terminal() || self.terminated.swap(true, Ordering::SeqCst) {
                return None;
            }
            if status != RunStatus::Running {
                *current = RunStatus::Terminated;
            }
            status
        };

        for runnable in self.runnables.read().iter() {
            runnable.interrupt();
        }
        let killed = self.executor.terminate_all();
        info!(run = self.ident, killed, "Terminating run");

        if status != RunStatus::Running {
            self.announce(RunStatus::Terminated, repository);
        }

        Some(status)
    }

    /// Block until `perform` returned.
    pub fn wait_until_stopped(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.stop.wait_for(&mut stopped, std::time::Duration::from_millis(100));
            if !*stopped {
                // pairs may still be starting programs
                self.executor.terminate_all();
                for runnable in self.runnables.read().iter() {
                    runnable.interrupt();
                }
            }
        }
    }

    /// Stop the run, killing its programs. Blocks until a running run stopped.
    pub fn terminate(&self, repository: &Repository) -> bool {
        match self.request_termination(repository) {
            Some(RunStatus::Running) => {
                self.wait_until_stopped();
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}
