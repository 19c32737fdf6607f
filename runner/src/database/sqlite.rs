use super::{ConnectionError, SQL_SCHEMA, SQL_SCHEMA_NUMBER};
use crate::{config::DatabaseConfig, run::RunStatus};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{fmt::Debug, sync::Arc};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

/// Row of the status history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub run: String,
    pub client: String,
    pub resume: bool,
    pub status: RunStatus,
    pub changed: String,
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::open(Connection::open(&config.path)?)))
    }

    pub fn in_memory() -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::open(Connection::open_in_memory()?)))
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        self.lock().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0)
            .map_err(|_| ConnectionError::StillShared)?
            .into_inner()
            .close()
    }

    pub fn store_status(&self, entry: &StatusEntry) -> Result<i64, ConnectionError> {
        self.lock().store_status(entry)
    }

    pub fn latest_status(&self, run: &str) -> Result<Option<RunStatus>, ConnectionError> {
        self.lock().latest_status(run)
    }

    pub fn history(&self, run: &str) -> Result<Vec<StatusEntry>, ConnectionError> {
        self.lock().history(run)
    }
}

impl InnerConnection {
    pub fn open(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    pub fn store_status(&self, entry: &StatusEntry) -> Result<i64, ConnectionError> {
        let id = self
            .connection
            .prepare_cached(
                "insert into run_status
                 (run, client, resume, status, changed)
                 values (?, ?, ?, ?, ?) returning id",
            )?
            .query_row(
                params![
                    entry.run.as_str(),
                    entry.client.as_str(),
                    entry.resume,
                    entry.status as u8,
                    entry.changed.as_str()
                ],
                |row| row.get(0),
            )?;

        debug!(id = id, run = entry.run, status = ?entry.status, "Stored run status");

        Ok(id)
    }

    pub fn latest_status(&self, run: &str) -> Result<Option<RunStatus>, ConnectionError> {
        let status: Option<u8> = self
            .connection
            .prepare_cached("select status from run_status where run = ? order by id desc limit 1")?
            .query_row(params![run], |row| row.get(0))
            .optional()?;

        status
            .map(|status| RunStatus::try_from(status).map_err(ConnectionError::UnknownStatus))
            .transpose()
    }

    pub fn history(&self, run: &str) -> Result<Vec<StatusEntry>, ConnectionError> {
        self.connection
            .prepare_cached(
                "select run, client, resume, status, changed from run_status
                 where run = ? order by id",
            )?
            .query_map(params![run], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get::<_, u8>(3)?, row.get(4)?))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                let (run, client, resume, status, changed) = result?;
                init.push(StatusEntry {
                    run,
                    client,
                    resume,
                    status: RunStatus::try_from(status).map_err(ConnectionError::UnknownStatus)?,
                    changed,
                });

                Ok::<Vec<StatusEntry>, ConnectionError>(init)
            })
    }
}
