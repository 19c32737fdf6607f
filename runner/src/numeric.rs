use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum NumericError {
    #[error("failed to spawn numeric backend: {0}")]
    Spawn(std::io::Error),
    #[error("failed to wait for numeric backend: {0}")]
    Wait(#[from] std::io::Error),
    #[error("numeric backend timed out")]
    Timeout,
    #[error("numeric backend failed: {0}")]
    Failed(String),
    #[error("numeric backend returned '{0}' which is not a number")]
    InvalidOutput(String),
}

/// External service evaluating statistics over a data set.
pub trait NumericBackend: Debug + Send + Sync {
    /// Estimated number of clusters in the tab separated coordinates at `data`.
    fn gap_statistic(&self, data: &Path, max_clusters: usize, bootstraps: usize) -> Result<usize, NumericError>;
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NumericConfig {
    #[serde(default = "default_rscript")]
    pub exec: PathBuf,
    /// timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_rscript() -> PathBuf {
    PathBuf::from("Rscript")
}

fn default_timeout() -> u64 {
    600
}

const GAP_STATISTIC_SCRIPT: &str = r#"args <- commandArgs(trailingOnly = TRUE)
x <- as.matrix(read.table(args[1], sep = "\t", row.names = 1, comment.char = "/"))
suppressMessages(library(cluster))
result <- clusGap(x, FUNcluster = kmeans, K.max = as.integer(args[2]), B = as.integer(args[3]))
cat(maxSE(f = result$Tab[, 3], SE.f = result$Tab[, 4]))
"#;

/// Numeric backend running R scripts through `Rscript`.
#[derive(Debug, Clone)]
pub struct RscriptBackend {
    exec: PathBuf,
    timeout: Duration,
}

impl RscriptBackend {
    pub fn load(config: &NumericConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            timeout: Duration::from_secs(config.timeout),
        }
    }

    fn evaluate(&self, script: &str, args: &[String]) -> Result<String, NumericError> {
        let mut child = Command::new(&self.exec)
            .arg("-e")
            .arg(script)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(NumericError::Spawn)?;

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                child.kill()?;
                child.wait()?;
                return Err(NumericError::Timeout);
            }
        };

        let mut stdout = String::new();
        if let Some(mut output) = child.stdout.take() {
            output.read_to_string(&mut stdout)?;
        }

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut output) = child.stderr.take() {
                output.read_to_string(&mut stderr)?;
            }
            error!(stderr = stderr, "Rscript exited with {status}");

            return Err(NumericError::Failed(stderr));
        }

        debug!(output = stdout, "Rscript finished");

        Ok(stdout)
    }
}

impl NumericBackend for RscriptBackend {
    fn gap_statistic(&self, data: &Path, max_clusters: usize, bootstraps: usize) -> Result<usize, NumericError> {
        let output = self.evaluate(
            GAP_STATISTIC_SCRIPT,
            &[
                data.to_string_lossy().into_owned(),
                max_clusters.to_string(),
                bootstraps.to_string(),
            ],
        )?;

        let trimmed = output.trim();
        trimmed
            .parse::<usize>()
            .or_else(|_| trimmed.parse::<f64>().map(|value| value.round() as usize))
            .map_err(|_| NumericError::InvalidOutput(trimmed.to_owned()))
    }
}
