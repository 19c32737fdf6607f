use super::{
    pool::PoolError,
    scheduler::{ActiveIteration, RunScheduler},
    SupervisedThread,
};
use crate::{
    repository::{finder::RunFinder, Repository},
    run::RunStatus,
    testing::{fixture, Fixture, CLUSTERING_RUN, OPTIMIZATION_RUN},
};
use chrono::Local;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn scheduler(fixture: &Fixture) -> Arc<RunScheduler> {
    let repository = Arc::new(Repository::load(fixture.config.clone()).unwrap());
    RunFinder::new(repository.clone(), None, true).scan().unwrap();

    Arc::new(RunScheduler::new(repository, Some(Duration::from_millis(20))).unwrap())
}

#[test]
pub fn reject_unknown_and_duplicate_entries() {
    let fixture = fixture("true");
    fixture.write_run("tune", OPTIMIZATION_RUN);
    let scheduler = scheduler(&fixture);

    assert!(!scheduler.schedule("alice", "unknown"));
    assert!(scheduler.schedule("alice", "tune"));
    assert!(!scheduler.schedule("alice", "tune"));
    assert_eq!(scheduler.queue().len(), 1);

    // a different client is a different entry
    assert!(scheduler.schedule("bob", "tune"));
    assert_eq!(scheduler.queue().len(), 2);
}

#[test]
pub fn resume_requires_result_folder() {
    let fixture = fixture("true");
    let scheduler = scheduler(&fixture);

    assert!(!scheduler.schedule_resume("alice", "01_01_2023-00_00_00_tune"));

    std::fs::create_dir_all(fixture.repository().join("results/01_01_2023-00_00_00_tune")).unwrap();
    assert!(scheduler.schedule_resume("alice", "01_01_2023-00_00_00_tune"));
    assert!(!scheduler.schedule_resume("alice", "01_01_2023-00_00_00_tune"));
}

#[test]
pub fn terminate_queued_entry_without_starting() {
    let fixture = fixture("true");
    fixture.write_run("tune", OPTIMIZATION_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "tune"));
    assert!(!scheduler.terminate("bob", "tune"));
    assert!(scheduler.terminate("alice", "tune"));

    assert!(scheduler.queue().is_empty());
    assert!(!scheduler.dispatch_once());
    assert!(scheduler.runs("alice").is_empty());
    assert!(!scheduler.terminate("alice", "tune"));
}

#[test]
pub fn reject_run_active_for_another_client() {
    let fixture = fixture("exec sleep 5");
    fixture.write_run("slow", CLUSTERING_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "slow"));
    assert!(scheduler.dispatch_once());
    assert!(scheduler.queue().is_empty());

    let (status, _) = scheduler.run_status("alice", "slow").unwrap();
    assert!(status.is_active());
    assert!(!scheduler.schedule("bob", "slow"));

    assert!(scheduler.terminate("alice", "slow"));
    assert_eq!(scheduler.run_status("alice", "slow"), Some((RunStatus::Terminated, 100.0)));

    // terminal runs no longer block the run
    assert!(scheduler.schedule("bob", "slow"));
}

fn wait_for_status(scheduler: &RunScheduler, client: &str, id: &str, status: RunStatus) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if scheduler.run_status(client, id).map(|(current, _)| current) == Some(status) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
pub fn concurrent_schedules_never_duplicate_a_dispatched_run() {
    let fixture = fixture("exec sleep 5");
    fixture.write_run("slow", CLUSTERING_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "slow"));
    let clients = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            thread::spawn(move || (0..200).filter(|_| scheduler.schedule("alice", "slow")).count())
        })
        .collect::<Vec<_>>();
    assert!(scheduler.dispatch_once());

    let accepted: usize = clients.into_iter().map(|client| client.join().unwrap()).sum();
    assert_eq!(accepted, 0);
    assert!(scheduler.queue().is_empty());
    assert_eq!(scheduler.runs("alice").len(), 1);

    assert!(scheduler.terminate("alice", "slow"));
}

#[test]
pub fn interrupt_terminates_running_runs() {
    let fixture = fixture("exec sleep 5");
    fixture.write_run("slow", CLUSTERING_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "slow"));
    assert!(scheduler.dispatch_once());
    assert!(wait_for_status(&scheduler, "alice", "slow", RunStatus::Running));

    let started = Instant::now();
    scheduler.interrupt();

    // the program was killed instead of waited for
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(scheduler.run_status("alice", "slow").map(|(status, _)| status), Some(RunStatus::Terminated));
    assert!(matches!(
        scheduler.register_iteration_runnable(|| {}),
        Err(PoolError::ShutDown(_))
    ));
    assert!(scheduler.is_idle());
}

#[test]
pub fn resize_only_the_iteration_pool() {
    let fixture = fixture("true");
    let scheduler = scheduler(&fixture);

    assert_eq!(scheduler.thread_pool_sizes(), (2, 2));
    scheduler.update_thread_pool_size(4).unwrap();
    assert_eq!(scheduler.thread_pool_sizes(), (2, 4));
}

#[test]
pub fn track_active_iterations() {
    let fixture = fixture("true");
    let scheduler = scheduler(&fixture);

    scheduler.inform_on_started_iteration_runnable(ActiveIteration {
        run: "run".to_owned(),
        program: "fake".to_owned(),
        data: "points".to_owned(),
        iteration: 3,
        started: Local::now(),
    });
    let active = scheduler.active_iterations();
    assert_eq!(active.len(), 1);
    assert_eq!(active[&std::thread::current().id()].iteration, 3);

    scheduler.inform_on_finished_iteration_runnable();
    assert!(scheduler.active_iterations().is_empty());
}
