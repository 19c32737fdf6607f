use super::{
    divisive::Divisive, store::OptimizationResultStore, MethodSpec, OptimizationError,
    OptimizationStrategy,
};
use crate::{
    params::{NamedParameter, ParameterSet},
    quality::QualitySet,
};
use tracing::debug;

pub const PREFERENCE_PARAMETER: &str = "preference";
pub const DEFAULT_TRIES_ON_NOT_TERMINATED: usize = 3;

/// Divisive search over the preference parameter that retries the remaining
/// parameters whenever a clustering did not terminate.
#[derive(Clone, Debug)]
pub struct Diverging {
    outer: Divisive,
    iteration_parameters: Vec<NamedParameter>,
    tries: usize,
    inner: Option<Divisive>,
    last_not_terminated: bool,
}

impl Diverging {
    pub fn new(parameters: Vec<NamedParameter>, iterations: usize, tries: usize) -> Result<Self, OptimizationError> {
        let (preference, iteration_parameters): (Vec<_>, Vec<_>) = parameters
            .into_iter()
            .partition(|named| named.name == PREFERENCE_PARAMETER);

        if preference.is_empty() {
            return Err(OptimizationError::Incompatible(format!(
                "diverging optimization requires a '{PREFERENCE_PARAMETER}' parameter"
            )));
        }

        Ok(Self {
            outer: Divisive::new(preference, iterations),
            iteration_parameters,
            tries,
            inner: None,
            last_not_terminated: false,
        })
    }

    fn new_inner(&self) -> Option<Divisive> {
        if self.iteration_parameters.is_empty() {
            return None;
        }

        let iterations = self.tries.pow(self.iteration_parameters.len() as u32);
        let mut inner = Divisive::new(self.iteration_parameters.clone(), iterations);
        inner.init();

        Some(inner)
    }
}

impl OptimizationStrategy for Diverging {
    fn init_parameter_values(&mut self, _spec: &MethodSpec) -> Result<(), OptimizationError> {
        self.outer.init();
        self.inner = None;
        self.last_not_terminated = false;

        Ok(())
    }

    fn has_next(&self) -> bool {
        let retry = self.last_not_terminated
            && self
                .inner
                .as_ref()
                .map_or(false, |inner| inner.has_next());

        self.outer.has_next() || retry
    }

    fn next_parameter_set(
        &mut self,
        forced: Option<&ParameterSet>,
        store: &OptimizationResultStore,
        _spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError> {
        if self.last_not_terminated {
            if self.inner.is_none() {
                self.inner = self.new_inner();
            }

            if let Some(ref mut inner) = self.inner {
                if inner.has_next() {
                    match inner.step(forced) {
                        Ok(iteration_set) => {
                            if let Some(forced) = forced {
                                return Ok(forced.clone());
                            }

                            debug!("Retrying last preference with {iteration_set}");
                            let preference = store.parameter_sets()?.last().cloned().unwrap_or_default();

                            return Ok(preference.merged(&iteration_set));
                        }
                        Err(OptimizationError::NoParameterSetFound(_)) => {}
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        // advance the preference with a fresh retry grid
        self.inner = self.new_inner();
        let iteration_set = match self.inner {
            Some(ref mut inner) => inner.step(forced)?,
            None => ParameterSet::new(),
        };
        let preference = self.outer.step(forced)?;

        match forced {
            Some(forced) => Ok(forced.clone()),
            None => Ok(iteration_set.merged(&preference)),
        }
    }

    fn total_iteration_count(&self) -> usize {
        self.outer.total_iteration_count()
    }

    fn on_feedback(&mut self, _set: &ParameterSet, _qualities: &QualitySet) {
        self.last_not_terminated = false;
        self.inner = None;
    }

    fn on_not_terminated(&mut self, _set: &ParameterSet, _qualities: &QualitySet) {
        self.last_not_terminated = true;
    }

    fn is_diverging(&self) -> bool {
        true
    }
}
