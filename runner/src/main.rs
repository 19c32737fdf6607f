use clap::{Parser, Subcommand};
use clusteval_runner::{
    config::BackendConfig,
    repository::{finder::RunFinder, Repository},
    run::RunStatus,
    threading::{scheduler::RunScheduler, supervisor::SupervisorThread, SupervisedThread},
};
use std::{
    path::PathBuf,
    process::exit,
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run scheduler and parameter optimizer for clustering benchmarks")]
struct Cli {
    /// backend configuration
    #[arg(short, long, global = true, default_value = "clusteval.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and every run file
    Check,
    /// Watch the repository and execute scheduled runs until killed
    Serve,
    /// Execute runs by name and wait for them
    Run {
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(long, default_value = "cli")]
        client: String,
    },
    /// Resume runs from their result folders and wait for them
    Resume {
        #[arg(required = true)]
        results: Vec<String>,
        #[arg(long, default_value = "cli")]
        client: String,
    },
}

fn load_repository(path: &PathBuf) -> Arc<Repository> {
    let config = match BackendConfig::load(path) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load {}: {error}", path.to_string_lossy());
            exit(1)
        }
    };

    if config.preflight_checks() {
        error!("Preflight checks failed, see above");
        exit(1)
    }

    match Repository::load(config) {
        Ok(repository) => Arc::new(repository),
        Err(error) => {
            error!(error = ?error, "Failed to load repository: {error}");
            exit(1)
        }
    }
}

fn start_scheduler(repository: &Arc<Repository>) -> Arc<RunScheduler> {
    let sleep = repository
        .config()
        .supervisor
        .scheduler_sleep
        .map(Duration::from_millis);

    match RunScheduler::new(repository.clone(), sleep) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(error) => {
            error!(error = ?error, "Failed to start scheduler: {error}");
            exit(1)
        }
    }
}

/// Schedule `ids`, wait for all runs and report whether every one finished.
fn execute(repository: Arc<Repository>, client: &str, ids: &[String], resume: bool) -> bool {
    let finder = RunFinder::new(repository.clone(), None, true);
    if let Err(error) = finder.scan() {
        error!(error = ?error, "Failed to scan runs: {error}");
        return false;
    }
    repository.set_initialized();

    let scheduler = start_scheduler(&repository);
    let dispatcher = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.run())
    };

    let mut scheduled = true;
    for id in ids {
        let accepted = if resume {
            scheduler.schedule_resume(client, id)
        } else {
            scheduler.schedule(client, id)
        };

        if !accepted {
            error!("Failed to schedule {id}");
            scheduled = false;
        }
    }

    scheduler.wait_until_idle();

    let finished = scheduler
        .runs(client)
        .into_iter()
        .map(|run| {
            info!(run = run.ident, "Run ended as {}", run.status);
            run.status == RunStatus::Finished
        })
        .fold(true, |all, finished| all && finished);

    scheduler.interrupt();
    if dispatcher.join().is_err() {
        warn!("Scheduler thread panicked");
    }

    scheduled && finished
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let success = match cli.command {
        Command::Check => {
            let repository = load_repository(&cli.config);
            let finder = RunFinder::new(repository.clone(), None, true);

            match finder.scan() {
                Ok(report) => {
                    info!(
                        valid = report.registered + report.unchanged,
                        invalid = report.failed.len(),
                        "Checked runs"
                    );
                    report.failed.is_empty()
                }
                Err(error) => {
                    error!(error = ?error, "Failed to scan runs: {error}");
                    false
                }
            }
        }
        Command::Serve => {
            let repository = load_repository(&cli.config);
            let scheduler = start_scheduler(&repository);
            let supervisor = SupervisorThread::new(repository, scheduler);

            supervisor.run();
            // check once mode returns early, the scheduler keeps serving
            supervisor.join();
            true
        }
        Command::Run { names, client } => execute(load_repository(&cli.config), &client, &names, false),
        Command::Resume { results, client } => execute(load_repository(&cli.config), &client, &results, true),
    };

    if !success {
        exit(1)
    }
}
