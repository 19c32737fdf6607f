use super::{parse_qualities, IngestorError, RunOutput};
use crate::{
    config::{ConfigErrors, IngestorConfig},
    quality::{QualityMeasure, QualitySet},
};
use std::{
    io::{Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct ExecIngestor {
    pub ingestor: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ExecIngestor {
    pub fn load(config: &IngestorConfig) -> Result<Self, ConfigErrors> {
        match config {
            IngestorConfig::Exec {
                exec,
                args,
                timeout,
            } => {
                if *timeout == 0 {
                    error!("Ingestor timeout must be a positive number of milliseconds");
                    return Err(ConfigErrors::FailedLoadIngestor);
                }

                Ok(Self {
                    ingestor: exec.clone(),
                    args: args.clone(),
                    timeout: Duration::from_millis(*timeout),
                })
            }
            IngestorConfig::Null => {
                error!("The exec ingestor requires ingest.exec to point to the evaluation script");

                Err(ConfigErrors::FailedLoadIngestor)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(output))]
    pub fn ingest(&self, output: &RunOutput, measures: &[QualityMeasure]) -> Result<QualitySet, IngestorError> {
        let mut handle = Command::new(&self.ingestor)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(IngestorError::SpawnIngestor)?;

        let mut stdin = handle.stdin.take().expect_or_log("stdin of the ingestor is piped");
        stdin.write_all(output.stdout.as_bytes())?;
        // closing stdin marks the end of the program output for the ingestor
        drop(stdin);

        debug!("Ingestor waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => {
                debug!("Ingestor exit status: {status:?}");

                status.success()
            }
            None => {
                debug!("Ingestor ran into timeout, attempting to continue");
                handle.kill()?;
                handle.wait()?;

                return Err(IngestorError::ChildTimeout);
            }
        };

        if !status {
            let mut stderr_buffer = String::new();

            if let Some(mut stderr) = handle.stderr.take() {
                stderr.read_to_string(&mut stderr_buffer)?;
            }

            debug!(
                stderr = stderr_buffer,
                message = "Ingestor failed to ingest input, attempting to continue"
            );
        }

        // retrieve output from ingestor
        let mut buffer = String::new();
        if let Some(mut stdout) = handle.stdout.take() {
            stdout.read_to_string(&mut buffer)?;
        }

        debug!("Output from ingestor: {buffer}");

        parse_qualities(&buffer, measures).map_err(|e| {
            error!("Ingestor failed to read qualities: {e}");
            e
        })
    }
}
