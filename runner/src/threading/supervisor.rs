use super::{scheduler::RunScheduler, SupervisedThread};
use crate::repository::{finder::RunFinder, Repository};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Supervised {
    thread: Arc<dyn SupervisedThread>,
    handle: Option<JoinHandle<()>>,
    restarts: usize,
}

impl Supervised {
    fn start(&mut self) {
        let thread = self.thread.clone();

        match thread::Builder::new()
            .name(self.thread.name().to_owned())
            .spawn(move || thread.run())
        {
            Ok(handle) => self.handle = Some(handle),
            Err(error) => error!(error = ?error, thread = self.thread.name(), "Failed to start thread: {error}"),
        }
    }

    fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(false, |handle| !handle.is_finished())
    }
}

/// Keeps the finder and scheduler threads alive.
#[derive(Debug)]
pub struct SupervisorThread {
    repository: Arc<Repository>,
    scheduler: Arc<RunScheduler>,
    threads: Mutex<Vec<Supervised>>,
    sleep: Duration,
    check_once: bool,
    interrupted: AtomicBool,
    wakeup: (Mutex<()>, Condvar),
}

impl SupervisorThread {
    pub fn new(repository: Arc<Repository>, scheduler: Arc<RunScheduler>) -> Self {
        let config = &repository.config().supervisor;
        let finder = RunFinder::new(
            repository.clone(),
            config.finder_sleep.map(Duration::from_millis),
            config.check_once,
        );

        let threads = vec![
            Supervised {
                thread: Arc::new(finder),
                handle: None,
                restarts: 0,
            },
            Supervised {
                thread: scheduler.clone(),
                handle: None,
                restarts: 0,
            },
        ];

        Self {
            sleep: Duration::from_millis(config.sleep),
            check_once: config.check_once,
            repository,
            scheduler,
            threads: Mutex::new(threads),
            interrupted: AtomicBool::new(false),
            wakeup: (Mutex::new(()), Condvar::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<RunScheduler> {
        &self.scheduler
    }

    pub fn restarts(&self) -> usize {
        self.threads.lock().iter().map(|thread| thread.restarts).sum()
    }

    /// Add a thread that is started and kept alive with the others.
    pub fn supervise(&self, thread: Arc<dyn SupervisedThread>) {
        self.threads.lock().push(Supervised {
            thread,
            handle: None,
            restarts: 0,
        });
    }

    /// Start every thread once and restart dead ones until interrupted.
    ///
    /// In check once mode the supervisor returns once the repository is
    /// initialized and leaves its threads running, see `join`.
    pub fn run(&self) {
        for thread in self.threads.lock().iter_mut() {
            thread.start();
        }
        info!("Supervisor started");

        while !self.interrupted.load(Ordering::SeqCst) {
            if self.check_once {
                if self.repository.is_initialized() {
                    info!("Repository initialized, no longer watching threads");
                    return;
                }
            } else {
                for thread in self.threads.lock().iter_mut() {
                    if !thread.is_alive() && !self.interrupted.load(Ordering::SeqCst) {
                        warn!(thread = thread.thread.name(), "Thread died, restarting it");
                        thread.restarts += 1;
                        thread.start();
                    }
                }
            }

            let mut guard = self.wakeup.0.lock();
            if !self.interrupted.load(Ordering::SeqCst) {
                self.wakeup.1.wait_for(&mut guard, self.sleep);
            }
        }

        self.interrupt();
    }

    /// Block until every owned thread ended.
    pub fn join(&self) {
        // handles are taken out so `interrupt` can still lock the threads meanwhile
        let handles = self
            .threads
            .lock()
            .iter_mut()
            .filter_map(|thread| thread.handle.take().map(|handle| (thread.thread.name().to_owned(), handle)))
            .collect::<Vec<_>>();

        for (name, handle) in handles {
            if handle.join().is_err() {
                error!(thread = name, "Thread panicked");
            }
        }
    }

    /// Stop and join every owned thread.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wakeup.1.notify_all();

        let mut threads = self.threads.lock();
        for thread in threads.iter() {
            thread.thread.interrupt();
        }

        for thread in threads.iter_mut() {
            if let Some(handle) = thread.handle.take() {
                if handle.join().is_err() {
                    error!(thread = thread.thread.name(), "Thread panicked");
                }
                debug!(thread = thread.thread.name(), "Joined thread");
            }
        }
    }
}
