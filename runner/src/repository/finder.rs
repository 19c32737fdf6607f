use super::Repository;
use crate::{config::ConfigErrors, run::parser::parse_run, threading::SupervisedThread};
use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_SLEEP: Duration = Duration::from_secs(10);

/// Summary of a single repository scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub registered: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: Vec<PathBuf>,
}

/// Scans `<repository>/runs` for `*.run` files.
#[derive(Debug)]
pub struct RunFinder {
    repository: Arc<Repository>,
    sleep: Duration,
    check_once: bool,
    interrupted: AtomicBool,
    wakeup: (Mutex<()>, Condvar),
}

impl RunFinder {
    pub fn new(repository: Arc<Repository>, sleep: Option<Duration>, check_once: bool) -> Self {
        Self {
            repository,
            sleep: sleep.unwrap_or(DEFAULT_SLEEP),
            check_once,
            interrupted: AtomicBool::new(false),
            wakeup: (Mutex::new(()), Condvar::new()),
        }
    }

    fn matcher() -> Result<GlobMatcher, ConfigErrors> {
        Ok(Glob::new("*.run")?.compile_matcher())
    }

    /// Parse every new or changed run file and drop runs whose file vanished.
    pub fn scan(&self) -> Result<ScanReport, ConfigErrors> {
        let matcher = Self::matcher()?;
        let runs_dir = self.repository.config().runs_dir();
        let mut report = ScanReport::default();

        if !runs_dir.is_dir() {
            warn!(path = ?runs_dir, "Run directory does not exist");
        }

        let files = WalkBuilder::new(&runs_dir)
            .max_depth(Some(1))
            .standard_filters(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(error = ?error, "Failed to search for runs: {error}");
                    None
                }
            })
            .map(DirEntry::into_path)
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .map_or(false, |name| matcher.is_match(name))
            })
            .collect::<Vec<_>>();

        let mut seen = BTreeSet::new();
        for path in files {
            match parse_run(&path, self.repository.config()) {
                Ok(template) => {
                    seen.insert(template.name.clone());
                    if self.repository.register_template(template) {
                        report.registered += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Err(error) => {
                    error!(error = ?error, path = ?path, "Failed to parse run: {error}");
                    report.failed.push(path);
                }
            }
        }

        for name in self.repository.template_names() {
            if !seen.contains(&name) && self.repository.remove_template(&name) {
                info!(run = name, "Run file was removed");
                report.removed += 1;
            }
        }

        debug!(?report, "Scanned runs");

        Ok(report)
    }
}

impl SupervisedThread for RunFinder {
    fn name(&self) -> &str {
        "run-finder"
    }

    fn run(self: Arc<Self>) {
        while !self.interrupted.load(Ordering::SeqCst) {
            match self.scan() {
                Ok(_) => self.repository.set_initialized(),
                Err(error) => error!(error = ?error, "Run scan failed: {error}"),
            }

            if self.check_once {
                break;
            }

            let mut guard = self.wakeup.0.lock();
            if !self.interrupted.load(Ordering::SeqCst) {
                self.wakeup.1.wait_for(&mut guard, self.sleep);
            }
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wakeup.1.notify_all();
    }
}
