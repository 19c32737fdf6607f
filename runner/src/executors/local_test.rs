use super::{substitute, Invocation, LocalExecutor};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use tempfile::TempDir;

fn invocation(exec: &str, args: &[&str]) -> Invocation {
    Invocation {
        exec: PathBuf::from(exec),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        log: None,
        timeout: None,
    }
}

#[test]
pub fn substitute_placeholders() {
    let values: BTreeMap<String, String> = [
        ("i", "/data/iris.tsv"),
        ("k", "3"),
        ("o", "/results/out"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();
    let template = ["-i", "%i%", "--clusters=%k%", "%o%.conv", "%unknown%"]
        .map(str::to_owned)
        .to_vec();

    assert_eq!(
        substitute(&template, &values),
        vec!["-i", "/data/iris.tsv", "--clusters=3", "/results/out.conv", "%unknown%"]
    );
}

#[test]
pub fn execute_collects_output_and_log() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("echo.log");
    let executor = LocalExecutor::new();
    let mut call = invocation("echo", &["F1: 0.5"]);
    call.log = Some(log.clone());

    let output = executor.execute(&call).unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, "F1: 0.5\n");
    assert_eq!(executor.live_children(), 0);
    let logged = std::fs::read_to_string(log).unwrap();
    assert!(logged.starts_with("$ echo F1: 0.5\n"));
    assert!(logged.contains("F1: 0.5\n"));
}

#[test]
pub fn execute_kills_on_timeout() {
    let executor = LocalExecutor::new();
    let mut call = invocation("sleep", &["5"]);
    call.timeout = Some(Duration::from_millis(100));

    let output = executor.execute(&call).unwrap();

    assert!(output.timed_out);
    assert!(!output.success());
    assert!(output.runtime < Duration::from_secs(5));
}

#[test]
pub fn missing_program_fails_to_spawn() {
    let executor = LocalExecutor::new();

    assert!(executor
        .execute(&invocation("/nonexistent/program", &[]))
        .is_err());
}

#[test]
pub fn terminate_all_kills_live_children() {
    let executor = Arc::new(LocalExecutor::new());
    let worker = {
        let executor = executor.clone();
        thread::spawn(move || executor.execute(&invocation("sleep", &["10"])))
    };

    while executor.live_children() == 0 {
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(executor.terminate_all(), 1);
    let output = worker.join().unwrap().unwrap();
    assert!(!output.success());
    assert_eq!(output.status, None);
}

#[test]
pub fn reaped_children_leave_the_map() {
    let executor = LocalExecutor::new();

    for _ in 0..3 {
        assert!(executor.execute(&invocation("true", &[])).unwrap().success());
        // nothing is left behind that a later termination could signal
        assert_eq!(executor.live_children(), 0);
        assert_eq!(executor.terminate_all(), 0);
    }
}
