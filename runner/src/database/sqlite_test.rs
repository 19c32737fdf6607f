use super::sqlite::{SharedConnection, StatusEntry};
use crate::run::RunStatus;

fn entry(run: &str, status: RunStatus) -> StatusEntry {
    StatusEntry {
        run: run.to_owned(),
        client: "client".to_owned(),
        resume: false,
        status,
        changed: "01_02_2023-10_00_00".to_owned(),
    }
}

#[test]
pub fn latest_status_follows_history() {
    let connection = SharedConnection::in_memory().unwrap();
    connection.init().unwrap();

    assert_eq!(connection.latest_status("run").unwrap(), None);

    connection.store_status(&entry("run", RunStatus::Scheduled)).unwrap();
    connection.store_status(&entry("run", RunStatus::Running)).unwrap();
    connection.store_status(&entry("other", RunStatus::Error)).unwrap();
    connection.store_status(&entry("run", RunStatus::Finished)).unwrap();

    assert_eq!(connection.latest_status("run").unwrap(), Some(RunStatus::Finished));
    assert_eq!(
        connection
            .history("run")
            .unwrap()
            .into_iter()
            .map(|entry| entry.status)
            .collect::<Vec<_>>(),
        vec![RunStatus::Scheduled, RunStatus::Running, RunStatus::Finished]
    );
    connection.close().unwrap();
}

#[test]
pub fn init_is_idempotent() {
    let connection = SharedConnection::in_memory().unwrap();

    connection.init().unwrap();
    connection.init().unwrap();
}
