use crate::{
    repository::{finder::RunFinder, Repository},
    run::RunStatus,
    testing::{fixture, write_script, Fixture, CLUSTERING_RUN, OPTIMIZATION_RUN},
    threading::scheduler::RunScheduler,
};
use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const SCORING_PROGRAM: &str = "echo \"F1: $(( $1 * 10 ))\"\necho \"Runtime: 1\"";

fn scheduler(fixture: &Fixture) -> Arc<RunScheduler> {
    let repository = Arc::new(Repository::load(fixture.config.clone()).unwrap());
    RunFinder::new(repository.clone(), None, true).scan().unwrap();

    Arc::new(RunScheduler::new(repository, Some(Duration::from_millis(20))).unwrap())
}

fn complete_file(fixture: &Fixture, ident: &str) -> PathBuf {
    fixture
        .config
        .results_dir()
        .join(ident)
        .join("clusters/fake_points.results.qual.complete")
}

#[test]
pub fn optimization_run_records_every_iteration() {
    let fixture = fixture(SCORING_PROGRAM);
    fixture.write_run("tune", OPTIMIZATION_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "tune"));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();

    let runs = scheduler.runs("alice");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Finished);
    assert_eq!(runs[0].percent, 100.0);

    let contents = fs::read_to_string(complete_file(&fixture, &runs[0].ident)).unwrap();
    let lines = contents.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "iteration\tk\tF1\tRuntime");
    assert_eq!(lines.len(), 6);

    let status = scheduler.optimization_status("alice");
    let pair = &status[&runs[0].ident]["fake_points"];
    assert_eq!(pair.finished, 5);
    let (optimum, _) = &pair.optimum["F1"];
    assert_eq!(optimum.get("k"), Some("5"));

    // the run was copied into the result folder for resumes
    assert!(fixture
        .config
        .results_dir()
        .join(&runs[0].ident)
        .join("configs/tune.run")
        .is_file());
}

#[test]
pub fn resume_skips_recorded_iterations() {
    let fixture = fixture(SCORING_PROGRAM);
    fixture.write_run("tune", OPTIMIZATION_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "tune"));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();
    let ident = scheduler.runs("alice")[0].ident.clone();
    let before = fs::read_to_string(complete_file(&fixture, &ident)).unwrap();

    assert!(scheduler.schedule_resume("alice", &ident));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();

    assert_eq!(scheduler.run_status("alice", &ident).map(|(status, _)| status), Some(RunStatus::Finished));
    let after = fs::read_to_string(complete_file(&fixture, &ident)).unwrap();
    assert_eq!(before, after);
}

#[test]
pub fn resume_completes_terminated_run() {
    // k >= 4 hangs until the run is terminated
    let fixture = fixture(&format!("if [ \"$1\" -ge 4 ]; then exec sleep 30; fi\n{SCORING_PROGRAM}"));
    fixture.write_run("tune", OPTIMIZATION_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("alice", "tune"));
    assert!(scheduler.dispatch_once());
    let ident = scheduler.runs("alice")[0].ident.clone();
    let complete = complete_file(&fixture, &ident);

    let deadline = Instant::now() + Duration::from_secs(10);
    while fs::read_to_string(&complete).map_or(0, |contents| contents.lines().count()) < 4 {
        assert!(Instant::now() < deadline, "first iterations did not finish");
        thread::sleep(Duration::from_millis(20));
    }

    assert!(scheduler.terminate("alice", &ident));
    assert_eq!(
        scheduler.run_status("alice", &ident).map(|(status, _)| status),
        Some(RunStatus::Terminated)
    );
    // killed iterations are left for the resume
    assert_eq!(fs::read_to_string(&complete).unwrap().lines().count(), 4);

    write_script(&fixture.dir.path().join("fake.sh"), SCORING_PROGRAM);
    assert!(scheduler.schedule_resume("alice", &ident));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();

    assert_eq!(
        scheduler.run_status("alice", &ident).map(|(status, _)| status),
        Some(RunStatus::Finished)
    );
    let contents = fs::read_to_string(&complete).unwrap();
    let mut iterations = contents
        .lines()
        .skip(1)
        .map(|line| line.split('\t').next().unwrap().parse::<u64>().unwrap())
        .collect::<Vec<_>>();
    iterations.sort_unstable();
    assert_eq!(iterations, vec![1, 2, 3, 4, 5]);
}

#[test]
pub fn clustering_run_writes_qualities() {
    let fixture = fixture(SCORING_PROGRAM);
    fixture.write_run("cluster", CLUSTERING_RUN);
    let scheduler = scheduler(&fixture);

    assert!(scheduler.schedule("bob", "cluster"));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();

    let runs = scheduler.runs("bob");
    assert_eq!(runs[0].status, RunStatus::Finished);

    let clusters = fixture.config.results_dir().join(&runs[0].ident).join("clusters");
    // the default k is 2
    let qualities = fs::read_to_string(clusters.join("fake_points.1.results.qual")).unwrap();
    assert_eq!(qualities, "F1\t20\nRuntime\t1\n");
    assert!(clusters.join("fake_points.1.log").is_file());
}

#[test]
pub fn missing_program_marks_run_as_error() {
    let fixture = fixture(SCORING_PROGRAM);
    fixture.write_run("cluster", CLUSTERING_RUN);
    let scheduler = scheduler(&fixture);
    fs::remove_file(fixture.dir.path().join("fake.sh")).unwrap();

    assert!(scheduler.schedule("bob", "cluster"));
    assert!(scheduler.dispatch_once());
    scheduler.wait_until_idle();

    assert_eq!(scheduler.runs("bob")[0].status, RunStatus::Error);
}
