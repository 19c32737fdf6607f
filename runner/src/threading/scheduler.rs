use super::{
    pool::{PoolError, TaskHandle, WorkerPool},
    SupervisedThread,
};
use crate::{
    optimization::OptimizationStatus,
    repository::Repository,
    run::{Run, RunStatus},
};
use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub client: String,
    // run name, or result id for resumes
    pub id: String,
    pub resume: bool,
}

/// Iteration currently executed by a worker thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveIteration {
    pub run: String,
    pub program: String,
    pub data: String,
    pub iteration: u64,
    pub started: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub ident: String,
    pub name: String,
    pub resume: bool,
    pub status: RunStatus,
    pub percent: f64,
}

/// Queues run requests of clients and dispatches them onto the pools.
#[derive(Debug)]
pub struct RunScheduler {
    repository: Arc<Repository>,
    queue: Mutex<VecDeque<QueueEntry>>,
    client_runs: Mutex<BTreeMap<String, Vec<Arc<Run>>>>,
    run_threads: Mutex<Vec<JoinHandle<()>>>,
    run_pool: WorkerPool,
    iteration_pool: WorkerPool,
    active: Mutex<HashMap<ThreadId, ActiveIteration>>,
    sleep: Duration,
    interrupted: AtomicBool,
    wakeup: (Mutex<()>, Condvar),
}

impl RunScheduler {
    pub fn new(repository: Arc<Repository>, sleep: Option<Duration>) -> Result<Self, PoolError> {
        let executor = &repository.config().executor;
        let run_pool = WorkerPool::new("run", executor.run_threads, false)?;
        let iteration_pool = WorkerPool::new("iteration", executor.iteration_threads(), executor.pin_workers)?;

        Ok(Self {
            repository,
            queue: Mutex::new(VecDeque::new()),
            client_runs: Mutex::new(BTreeMap::new()),
            run_threads: Mutex::new(Vec::new()),
            run_pool,
            iteration_pool,
            active: Mutex::new(HashMap::new()),
            sleep: sleep.unwrap_or(DEFAULT_SLEEP),
            interrupted: AtomicBool::new(false),
            wakeup: (Mutex::new(()), Condvar::new()),
        })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    fn is_active(&self, id: &str, resume: bool) -> bool {
        self.client_runs.lock().values().flatten().any(|run| {
            run.status().is_active()
                && if resume {
                    run.ident() == id
                } else {
                    run.name() == id
                }
        })
    }

    fn enqueue(&self, entry: QueueEntry) -> bool {
        // queue before client runs, the order `dispatch_once` locks them in
        let mut queue = self.queue.lock();
        if self.is_active(&entry.id, entry.resume) {
            warn!(client = entry.client, id = entry.id, "Run is already being executed");
            return false;
        }

        if queue.contains(&entry) {
            warn!(client = entry.client, id = entry.id, "Run is already queued");
            return false;
        }

        info!(client = entry.client, id = entry.id, resume = entry.resume, "Queued run");
        queue.push_back(entry);

        true
    }

    /// Queue the run `name` for `client`.
    pub fn schedule(&self, client: &str, name: &str) -> bool {
        if self.repository.run_template(name).is_none() {
            warn!(client = client, "Unknown run {name}");
            return false;
        }

        self.enqueue(QueueEntry {
            client: client.to_owned(),
            id: name.to_owned(),
            resume: false,
        })
    }

    /// Queue the resume of `result_id` for `client`.
    pub fn schedule_resume(&self, client: &str, result_id: &str) -> bool {
        if !self.repository.result_folder(result_id).is_dir() {
            warn!(client = client, "Unknown result {result_id}");
            return false;
        }

        self.enqueue(QueueEntry {
            client: client.to_owned(),
            id: result_id.to_owned(),
            resume: true,
        })
    }

    fn remove_queued(&self, client: &str, id: &str, resume: bool) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|entry| !(entry.client == client && entry.id == id && entry.resume == resume));

        before != queue.len()
    }

    fn terminate_live(&self, client: &str, id: &str, resume: bool) -> bool {
        let run = self.client_runs.lock().get(client).and_then(|runs| {
            runs.iter()
                .find(|run| {
                    run.status().is_active()
                        && run.is_resume() == resume
                        && (run.ident() == id || (!resume && run.name() == id))
                })
                .cloned()
        });

        // the lock is released, termination blocks until the run stopped
        run.map_or(false, |run| run.terminate(&self.repository))
    }

    /// Terminate a queued or running run (or resume) of `client`.
    #[instrument(skip(self))]
    pub fn terminate(&self, client: &str, id: &str) -> bool {
        self.remove_queued(client, id, true)
            || self.terminate_live(client, id, true)
            || self.remove_queued(client, id, false)
            || self.terminate_live(client, id, false)
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn runs(&self, client: &str) -> Vec<RunInfo> {
        self.client_runs
            .lock()
            .get(client)
            .map(|runs| {
                runs.iter()
                    .map(|run| RunInfo {
                        ident: run.ident().to_owned(),
                        name: run.name().to_owned(),
                        resume: run.is_resume(),
                        status: run.status(),
                        percent: run.percent_finished(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Status and percent of the run `id` (ident or name) of `client`.
    pub fn run_status(&self, client: &str, id: &str) -> Option<(RunStatus, f64)> {
        self.client_runs.lock().get(client).and_then(|runs| {
            runs.iter()
                .rev()
                .find(|run| run.ident() == id || run.name() == id)
                .map(|run| (run.status(), run.percent_finished()))
        })
    }

    /// Optimization progress of every run of `client`, finished runs are
    /// reported once and then forgotten.
    pub fn optimization_status(&self, client: &str) -> BTreeMap<String, BTreeMap<String, OptimizationStatus>> {
        let mut client_runs = self.client_runs.lock();
        let Some(runs) = client_runs.get_mut(client) else {
            return BTreeMap::new();
        };

        let status = runs
            .iter()
            .map(|run| (run.ident().to_owned(), run.optimization_status()))
            .collect();
        runs.retain(|run| !run.status().is_terminal());

        status
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
            && self
                .client_runs
                .lock()
                .values()
                .flatten()
                .all(|run| !run.status().is_active())
    }

    /// Start the next queued entry, returns false if the queue was empty.
    pub fn dispatch_once(self: &Arc<Self>) -> bool {
        // the queue stays locked until the run is registered, `is_idle` never sees a gap
        let mut queue = self.queue.lock();
        let Some(entry) = queue.pop_front() else {
            return false;
        };

        let run = if entry.resume {
            match Run::from_result(&entry.id, &entry.client, &self.repository) {
                Ok(run) => run,
                Err(error) => {
                    error!(error = ?error, result = entry.id, "Failed to load result for resume: {error}");
                    return true;
                }
            }
        } else {
            match self.repository.run_template(&entry.id) {
                Some(template) => Run::from_template(template, &entry.client, &self.repository),
                None => {
                    error!(run = entry.id, "Run vanished from the repository");
                    return true;
                }
            }
        };

        let run = Arc::new(run);
        run.set_status(RunStatus::Scheduled, &self.repository);
        self.client_runs
            .lock()
            .entry(entry.client.clone())
            .or_default()
            .push(run.clone());
        drop(queue);

        let scheduler = self.clone();
        let failed = run.clone();
        let spawned = thread::Builder::new()
            .name(format!("run-{}", run.ident()))
            .spawn(move || {
                let result = if entry.resume {
                    run.resume(&scheduler)
                } else {
                    run.perform(&scheduler)
                };

                if let Err(error) = result {
                    error!(error = ?error, run = run.ident(), "Run ended with an error: {error}");
                }
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.run_threads.lock();
                threads.retain(|thread| !thread.is_finished());
                threads.push(handle);
            }
            Err(error) => {
                error!(error = ?error, "Failed to start run thread: {error}");
                failed.set_status(RunStatus::Error, &self.repository);
            }
        }

        true
    }

    pub fn register_run_runnable<F>(&self, task: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_pool.submit(task)
    }

    pub fn register_iteration_runnable<F>(&self, task: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.iteration_pool.submit(task)
    }

    pub fn update_thread_pool_size(&self, size: usize) -> Result<(), PoolError> {
        self.iteration_pool.resize(size)
    }

    pub fn thread_pool_sizes(&self) -> (usize, usize) {
        (self.run_pool.size(), self.iteration_pool.size())
    }

    pub fn inform_on_started_iteration_runnable(&self, iteration: ActiveIteration) {
        self.active.lock().insert(thread::current().id(), iteration);
    }

    pub fn inform_on_finished_iteration_runnable(&self) {
        self.active.lock().remove(&thread::current().id());
    }

    pub fn active_iterations(&self) -> HashMap<ThreadId, ActiveIteration> {
        self.active.lock().clone()
    }

    /// Block until the queue is empty and no run is active, or the scheduler was interrupted.
    pub fn wait_until_idle(&self) {
        let mut guard = self.wakeup.0.lock();
        while !self.is_idle() && !self.interrupted.load(Ordering::SeqCst) {
            self.wakeup.1.wait_for(&mut guard, Duration::from_millis(200));
        }
    }
}

impl SupervisedThread for RunScheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn run(self: Arc<Self>) {
        info!("Scheduler started");

        while !self.interrupted.load(Ordering::SeqCst) {
            self.dispatch_once();

            let mut guard = self.wakeup.0.lock();
            if !self.interrupted.load(Ordering::SeqCst) {
                self.wakeup.1.wait_for(&mut guard, self.sleep);
            }
        }

        debug!("Scheduler stopped");
    }

    fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wakeup.1.notify_all();

        let runs: Vec<_> = self.client_runs.lock().values().flatten().cloned().collect();
        // flag every run first so no run waits on pool slots of another
        let running = runs
            .iter()
            .filter(|run| run.request_termination(&self.repository) == Some(RunStatus::Running))
            .collect::<Vec<_>>();
        for run in running {
            run.wait_until_stopped();
        }

        let cancelled = self.run_pool.shutdown_now() + self.iteration_pool.shutdown_now();
        info!(cancelled, "Scheduler interrupted");

        for thread in self.run_threads.lock().drain(..) {
            if thread.join().is_err() {
                error!("Run thread panicked");
            }
        }
    }
}
