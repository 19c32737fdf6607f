use super::{runnable::PairContext, RunError};
use crate::{
    executors::{substitute, Invocation},
    params::ParameterSet,
    quality::QualitySet,
    threading::scheduler::{ActiveIteration, RunScheduler},
};
use chrono::Local;
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};
use tracing::{debug, error, warn};

/// One invocation of a program with one parameter set.
#[derive(Debug)]
pub struct IterationRunnable {
    context: Arc<PairContext>,
    iteration: u64,
    parameter_set: ParameterSet,
}

impl IterationRunnable {
    pub fn new(context: Arc<PairContext>, iteration: u64, parameter_set: ParameterSet) -> Self {
        Self {
            context,
            iteration,
            parameter_set,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.context
            .clusters
            .join(format!("{}.{}.{suffix}", self.context.prefix(), self.iteration))
    }

    pub fn clustering_file(&self) -> PathBuf {
        self.file("results.conv")
    }

    pub fn quality_file(&self) -> PathBuf {
        self.file("results.qual")
    }

    pub fn log_file(&self) -> PathBuf {
        self.file("log")
    }

    /// Values for every placeholder of the argument template.
    ///
    /// Program parameters that are not optimized keep their defaults.
    pub fn placeholders(&self) -> BTreeMap<String, String> {
        let context = &self.context;
        let mut values = BTreeMap::new();

        values.insert("e".to_owned(), context.program.exec.to_string_lossy().into_owned());
        values.insert("i".to_owned(), context.data.path.to_string_lossy().into_owned());
        values.insert("o".to_owned(), self.clustering_file().to_string_lossy().into_owned());
        values.insert("q".to_owned(), self.quality_file().to_string_lossy().into_owned());
        values.insert(
            "gs".to_owned(),
            context
                .data
                .goldstandard
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        for (name, parameter) in context.program.parameters.iter() {
            values.insert(name.clone(), parameter.default_value());
        }
        for (name, value) in self.parameter_set.iter() {
            values.insert(name.clone(), value.clone());
        }

        values
    }

    pub fn invocation(&self) -> Invocation {
        Invocation {
            exec: self.context.program.exec.clone(),
            args: substitute(&self.context.program.args, &self.placeholders()),
            log: Some(self.log_file()),
            timeout: self.context.timeout,
        }
    }

    /// Run the program and turn its output into qualities.
    pub fn evaluate(&self) -> Result<QualitySet, RunError> {
        let context = &self.context;
        let output = context.executor.execute(&self.invocation())?;

        if output.timed_out {
            warn!(
                iteration = self.iteration,
                "{} did not terminate on {} within {:?}",
                context.program_name,
                context.data_name,
                context.timeout
            );

            return Ok(context.not_terminated());
        }

        if !output.success() {
            warn!(
                iteration = self.iteration,
                status = ?output.status,
                stderr = output.stderr,
                "{} failed on {}",
                context.program_name,
                context.data_name
            );

            return Ok(context.not_terminated());
        }

        Ok(context.ingestor.ingest(&output, &context.measures)?)
    }

    fn write_quality_file(&self, qualities: &QualitySet) -> std::io::Result<()> {
        let contents = qualities
            .iter()
            .map(|(measure, value)| format!("{measure}\t{value}\n"))
            .collect::<String>();

        fs::write(self.quality_file(), contents)
    }

    /// Evaluate the iteration and report the result to the optimization method.
    ///
    /// Failures are reported as not terminated so the method never waits on a
    /// lost iteration.
    #[tracing::instrument(level = "debug", skip(self, scheduler), fields(program = %self.context.program_name, data = %self.context.data_name, iteration = self.iteration))]
    pub fn execute(&self, scheduler: &RunScheduler) {
        let context = &self.context;

        if context.terminated.load(Ordering::SeqCst) {
            debug!("Run was terminated, skipping iteration");
            return;
        }

        scheduler.inform_on_started_iteration_runnable(ActiveIteration {
            run: context.run.clone(),
            program: context.program_name.clone(),
            data: context.data_name.clone(),
            iteration: self.iteration,
            started: Local::now(),
        });

        let qualities = match self.evaluate() {
            Ok(qualities) => qualities,
            Err(error) => {
                error!(error = ?error, "Iteration failed: {error}");
                context.failed_iterations.fetch_add(1, Ordering::SeqCst);

                context.not_terminated()
            }
        };

        // killed iterations must not end up in the results, a resume repeats them
        if !context.terminated.load(Ordering::SeqCst) {
            if let Err(error) = self.write_quality_file(&qualities) {
                warn!(error = ?error, "Failed to write quality file: {error}");
            }

            if let Some(ref method) = context.method {
                let feedback = if qualities.all_not_terminated() {
                    method.give_feedback_not_terminated(&self.parameter_set, qualities.clone())
                } else {
                    method.give_quality_feedback(&self.parameter_set, qualities.clone())
                };

                if let Err(error) = feedback
                    .and_then(|_| method.record_iteration(self.iteration, &self.parameter_set, &qualities))
                {
                    error!(error = ?error, "Failed to record iteration: {error}");
                }
            }
        }

        scheduler.inform_on_finished_iteration_runnable();
    }
}
