use parking_lot::{Condvar, Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to build thread pool {name}: {error}")]
    Build {
        name: String,
        error: rayon::ThreadPoolBuildError,
    },
    #[error("Thread pool {0} was shut down")]
    ShutDown(String),
    #[error("Thread pool {0} needs at least one thread")]
    Empty(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Cancelled,
    Panicked,
}

impl TaskState {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug)]
struct TaskShared {
    state: Mutex<TaskState>,
    changed: Condvar,
}

/// Awaitable and cancellable handle of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle(Arc<TaskShared>);

impl TaskHandle {
    fn new() -> Self {
        Self(Arc::new(TaskShared {
            state: Mutex::new(TaskState::Queued),
            changed: Condvar::new(),
        }))
    }

    pub fn state(&self) -> TaskState {
        *self.0.state.lock()
    }

    fn set(&self, state: TaskState) {
        *self.0.state.lock() = state;
        self.0.changed.notify_all();
    }

    // false if the task was cancelled before it started
    fn start(&self) -> bool {
        let mut state = self.0.state.lock();
        if *state != TaskState::Queued {
            return false;
        }
        *state = TaskState::Running;
        true
    }

    /// Cancel a task that has not started yet.
    pub fn cancel(&self) -> bool {
        let mut state = self.0.state.lock();
        if *state != TaskState::Queued {
            return false;
        }
        *state = TaskState::Cancelled;
        self.0.changed.notify_all();
        true
    }

    /// Block until the task finished or was cancelled.
    pub fn wait(&self) -> TaskState {
        let mut state = self.0.state.lock();
        while !state.is_done() {
            self.0.changed.wait(&mut state);
        }
        *state
    }
}

/// Counting semaphore whose limit can change while tasks hold permits.
#[derive(Debug)]
struct Permits {
    // (limit, taken)
    state: Mutex<(usize, usize)>,
    released: Condvar,
}

impl Permits {
    fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new((limit, 0)),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut state = self.state.lock();
        while state.1 >= state.0 {
            self.released.wait(&mut state);
        }
        state.1 += 1;
    }

    fn release(&self) {
        self.state.lock().1 -= 1;
        self.released.notify_one();
    }

    fn set_limit(&self, limit: usize) {
        self.state.lock().0 = limit;
        self.released.notify_all();
    }
}

/// Bounded pool of worker threads.
///
/// At most `size` tasks run at once. Growing swaps in a wider rayon pool,
/// tasks still queued on the old one share the same permits.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    pool: RwLock<Arc<ThreadPool>>,
    threads: AtomicUsize,
    size: AtomicUsize,
    permits: Arc<Permits>,
    pin_workers: bool,
    shutdown: AtomicBool,
    handles: Mutex<Vec<TaskHandle>>,
}

fn build(name: &str, size: usize, pin_workers: bool) -> Result<ThreadPool, PoolError> {
    if size == 0 {
        return Err(PoolError::Empty(name.to_owned()));
    }

    let thread_name = name.to_owned();
    let cores = affinity::get_core_num().max(1);

    ThreadPoolBuilder::new()
        .num_threads(size)
        .thread_name(move |index| format!("{thread_name}-{index}"))
        .start_handler(move |index| {
            if pin_workers {
                if let Err(error) = affinity::set_thread_affinity([index % cores]) {
                    warn!(error = ?error, "Failed to pin worker {index}: {error}");
                }
            }
        })
        .build()
        .map_err(|error| PoolError::Build {
            name: name.to_owned(),
            error,
        })
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, pin_workers: bool) -> Result<Self, PoolError> {
        debug!("Starting thread pool {name} with {size} threads");

        Ok(Self {
            name: name.to_owned(),
            pool: RwLock::new(Arc::new(build(name, size, pin_workers)?)),
            threads: AtomicUsize::new(size),
            size: AtomicUsize::new(size),
            permits: Arc::new(Permits::new(size)),
            pin_workers,
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn submit<F>(&self, task: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown(self.name.clone()));
        }

        let handle = TaskHandle::new();
        {
            let mut handles = self.handles.lock();
            handles.retain(|handle| !handle.state().is_done());
            handles.push(handle.clone());
        }

        let task_handle = handle.clone();
        let permits = self.permits.clone();
        let name = self.name.clone();
        self.pool.read().spawn(move || {
            if task_handle.state() == TaskState::Cancelled {
                return;
            }

            permits.acquire();
            if !task_handle.start() {
                permits.release();
                return;
            }

            let result = catch_unwind(AssertUnwindSafe(task));
            permits.release();

            match result {
                Ok(()) => task_handle.set(TaskState::Finished),
                Err(_) => {
                    error!("Task on {name} panicked");
                    task_handle.set(TaskState::Panicked);
                }
            }
        });

        Ok(handle)
    }

    /// Change the number of concurrently running tasks, queued and running
    /// tasks included.
    pub fn resize(&self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Err(PoolError::Empty(self.name.clone()));
        }
        if size == self.size() {
            return Ok(());
        }

        // shrinking keeps the threads, surplus workers wait for a permit
        if size > self.threads.load(Ordering::SeqCst) {
            let pool = build(&self.name, size, self.pin_workers)?;
            *self.pool.write() = Arc::new(pool);
            self.threads.store(size, Ordering::SeqCst);
        }
        self.permits.set_limit(size);
        self.size.store(size, Ordering::SeqCst);
        info!("Resized thread pool {} to {size} threads", self.name);

        Ok(())
    }

    /// Refuse new work and cancel every queued task, returns the number of cancelled tasks.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown.store(true, Ordering::SeqCst);

        let cancelled = self
            .handles
            .lock()
            .drain(..)
            .filter(|handle| handle.cancel())
            .count();
        debug!(cancelled, "Shut down thread pool {}", self.name);

        cancelled
    }
}
