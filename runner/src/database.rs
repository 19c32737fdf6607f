pub mod sqlite;

#[cfg(test)]
mod sqlite_test;

pub use sqlite::SharedConnection;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite failed: {0}")]
    SQLite(rusqlite::Error),
    #[error("Unknown run status {0}")]
    UnknownStatus(u8),
    #[error("Connection is still shared")]
    StillShared,
}

// ref: https://www.sqlite.org/lang_createtable.html
pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists run_status (
    id integer primary key,
    run text not null,
    client text not null,
    resume integer not null,
    status tinyint not null,
    changed text not null
);",
    "create index if not exists run_status_run on run_status (run);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
