use super::{ExecutorError, Invocation};
use crate::ingest::RunOutput;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Write},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct LiveChild {
    command: String,
    child: Child,
}

/// Launches programs on the local machine and keeps track of the live ones
/// so a run can be terminated.
///
/// Children are only reaped while the map is locked and leave it in the same
/// step, a pid in the map always belongs to one of our children.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    children: Mutex<BTreeMap<u32, LiveChild>>,
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut source) = source {
            if let Err(error) = source.read_to_string(&mut buffer) {
                warn!(error = ?error, "Failed to read child output: {error}");
            }
        }
        buffer
    })
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_children(&self) -> usize {
        self.children.lock().len()
    }

    /// Run `invocation` to completion, killing it once its timeout passed.
    #[tracing::instrument(level = "debug", skip(self), fields(exec = ?invocation.exec))]
    pub fn execute(&self, invocation: &Invocation) -> Result<RunOutput, ExecutorError> {
        let start = Instant::now();
        let mut child = Command::new(&invocation.exec)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| ExecutorError::Spawn {
                exec: invocation.exec.clone(),
                error,
            })?;

        let pid = child.id();
        // read concurrently, a full pipe would otherwise block the child
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        self.children.lock().insert(
            pid,
            LiveChild {
                command: invocation.command_line(),
                child,
            },
        );

        let (status, timed_out) = match self.wait(pid, start, invocation.timeout)? {
            Some(status) => (status.code(), false),
            None => (None, true),
        };

        let output = RunOutput {
            runtime: start.elapsed(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            status,
            timed_out,
        };

        debug!(
            "Finished in {} ms | status: {:?}",
            output.runtime.as_millis(),
            output.status
        );
        trace!("Output: {}", output.stdout);

        if let Some(ref log) = invocation.log {
            if let Err(error) = write_log(log, invocation, &output) {
                error!(error = ?error, log = ?log, "Failed to write program log: {error}");
            }
        }

        Ok(output)
    }

    /// Poll the child until it exited, `None` if it was killed on timeout.
    fn wait(&self, pid: u32, start: Instant, timeout: Option<Duration>) -> Result<Option<ExitStatus>, ExecutorError> {
        loop {
            {
                let mut children = self.children.lock();
                let Some(live) = children.get_mut(&pid) else {
                    return Ok(None);
                };

                let polled = match live.child.try_wait() {
                    Ok(Some(status)) => Some(Ok(Some(status))),
                    Ok(None) if timeout.map_or(false, |timeout| start.elapsed() >= timeout) => {
                        debug!(pid, "Program ran into its timeout");
                        Some(live.child.kill().and_then(|_| live.child.wait()).map(|_| None))
                    }
                    Ok(None) => None,
                    Err(error) => Some(Err(error)),
                };

                if let Some(result) = polled {
                    children.remove(&pid);
                    return Ok(result?);
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill every child that is still running, returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let children = self.children.lock();
        let mut killed = 0;

        for (pid, LiveChild { command, .. }) in children.iter() {
            match i32::try_from(*pid).map(Pid::from_raw) {
                Ok(pid) => match kill(pid, Signal::SIGKILL) {
                    Ok(()) => {
                        debug!(pid = %pid, command = command, "Killed child process");
                        killed += 1;
                    }
                    Err(error) => warn!(error = ?error, pid = %pid, "Failed to kill child process: {error}"),
                },
                Err(_) => warn!(pid, "Process id out of range"),
            }
        }

        killed
    }
}

fn write_log(path: &std::path::Path, invocation: &Invocation, output: &RunOutput) -> std::io::Result<()> {
    let mut file = File::create(path)?;

    writeln!(file, "$ {}", invocation.command_line())?;
    file.write_all(output.stdout.as_bytes())?;
    file.write_all(output.stderr.as_bytes())?;
    if output.timed_out {
        writeln!(file, "# killed after {} ms", output.runtime.as_millis())?;
    }

    Ok(())
}
