mod local;

#[cfg(test)]
mod local_test;

pub use local::LocalExecutor;

use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {exec}: {error}")]
    Spawn { exec: PathBuf, error: std::io::Error },
    #[error("Failed to wait for a child process: {0}")]
    Wait(#[from] std::io::Error),
    #[error("Failed to signal child process: {0}")]
    Signal(#[from] nix::errno::Errno),
}

/// A fully resolved program call.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub exec: PathBuf,
    pub args: Vec<String>,
    // stdout and stderr are copied here
    pub log: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.exec.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Replace every `%key%` in `template` with its value.
///
/// Placeholders without a value are kept and reported.
pub fn substitute(template: &[String], values: &BTreeMap<String, String>) -> Vec<String> {
    template
        .iter()
        .map(|argument| {
            let mut resolved = argument.clone();

            for (key, value) in values {
                resolved = resolved.replace(&format!("%{key}%"), value);
            }

            if resolved.matches('%').count() >= 2 {
                warn!(argument = argument, resolved = resolved, "Argument contains an unresolved placeholder");
            }

            resolved
        })
        .collect()
}
