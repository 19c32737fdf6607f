use super::{store::OptimizationResultStore, MethodSpec, OptimizationError, OptimizationStrategy};
use crate::params::{NamedParameter, ParameterSet};
use tracing::debug;

// keeps floor(x^(1/n)) from dropping a whole step on exact powers
const ROOT_EPSILON: f64 = 1e-9;

/// Grid search over evenly spaced values of every parameter.
#[derive(Clone, Debug)]
pub struct Divisive {
    parameters: Vec<NamedParameter>,
    iterations_per_parameter: Vec<usize>,
    values: Vec<Vec<String>>,
    current_pos: Vec<isize>,
}

impl Divisive {
    pub fn new(parameters: Vec<NamedParameter>, iterations: usize) -> Self {
        let iterations_per_parameter = iterations_per_parameter(&parameters, iterations);

        Self {
            parameters,
            iterations_per_parameter,
            values: Vec::new(),
            current_pos: Vec::new(),
        }
    }

    pub fn parameters(&self) -> &[NamedParameter] {
        &self.parameters
    }

    pub fn iterations_per_parameter(&self) -> &[usize] {
        &self.iterations_per_parameter
    }

    pub fn current_pos(&self) -> &[isize] {
        &self.current_pos
    }

    /// Realized grid per parameter, empty before initialization.
    pub fn values(&self) -> &[Vec<String>] {
        &self.values
    }

    /// Build the grids and rewind the position.
    pub fn init(&mut self) {
        self.values = self
            .parameters
            .iter()
            .zip(self.iterations_per_parameter.iter_mut())
            .map(|(named, count)| {
                let grid = named.parameter.grid(*count);
                // rounding integers may collapse grid points
                *count = grid.len();
                grid
            })
            .collect();

        let last = self.parameters.len().saturating_sub(1);
        self.current_pos = (0..self.parameters.len())
            .map(|index| if index == last { -1 } else { 0 })
            .collect();

        debug!(
            grid = ?self.iterations_per_parameter,
            "Initialized divisive grid"
        );
    }

    /// Mixed radix increment, the last parameter varies fastest.
    ///
    /// Returns false once the final combination is reached, the lower digits
    /// are wrapped back to 0 on the way.
    pub fn increase_current_pos(&mut self) -> bool {
        if self.parameters.is_empty() {
            return false;
        }

        let mut index = self.parameters.len() - 1;
        loop {
            if self.current_pos[index] < self.iterations_per_parameter[index] as isize - 1 {
                self.current_pos[index] += 1;
                return true;
            } else if index == 0 {
                return false;
            }

            self.current_pos[index] = 0;
            index -= 1;
        }
    }

    fn can_increase(&self) -> bool {
        !self.parameters.is_empty()
            && self
                .current_pos
                .iter()
                .zip(self.iterations_per_parameter.iter())
                .any(|(pos, count)| *pos < *count as isize - 1)
    }

    fn current_set(&self) -> Result<ParameterSet, OptimizationError> {
        let mut set = ParameterSet::new();

        for ((named, values), pos) in self
            .parameters
            .iter()
            .zip(self.values.iter())
            .zip(self.current_pos.iter())
        {
            if values.is_empty() {
                return Err(OptimizationError::NoParameterSetFound(format!(
                    "there are no possible values for parameter {}",
                    named.name
                )));
            }

            let value = usize::try_from(*pos)
                .ok()
                .and_then(|pos| values.get(pos))
                .ok_or_else(|| {
                    OptimizationError::NoParameterSetFound(format!(
                        "position {pos} of parameter {} is outside of its grid",
                        named.name
                    ))
                })?;
            set.insert(named.name.clone(), value.clone());
        }

        Ok(set)
    }

    pub(crate) fn step(&mut self, forced: Option<&ParameterSet>) -> Result<ParameterSet, OptimizationError> {
        let advanced = self.increase_current_pos();

        if let Some(forced) = forced {
            return Ok(forced.clone());
        }

        if !advanced {
            // report an empty grid before an exhausted one
            self.current_set()?;

            return Err(OptimizationError::NoParameterSetFound(
                "every grid point was issued already".to_owned(),
            ));
        }

        self.current_set()
    }
}

impl OptimizationStrategy for Divisive {
    fn init_parameter_values(&mut self, _spec: &MethodSpec) -> Result<(), OptimizationError> {
        self.init();
        Ok(())
    }

    fn has_next(&self) -> bool {
        self.can_increase()
    }

    fn next_parameter_set(
        &mut self,
        forced: Option<&ParameterSet>,
        _store: &OptimizationResultStore,
        _spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError> {
        self.step(forced)
    }

    fn total_iteration_count(&self) -> usize {
        if self.parameters.is_empty() {
            0
        } else {
            self.iterations_per_parameter.iter().product()
        }
    }
}

/// Split an iteration budget over the parameters.
///
/// Parameters with options take exactly their option count, the remaining
/// budget is spread as its n-th root over the other n parameters.
pub fn iterations_per_parameter(parameters: &[NamedParameter], iterations: usize) -> Vec<usize> {
    let mut remaining = iterations as f64;
    let mut remaining_parameters = parameters.len();

    let counts = parameters
        .iter()
        .map(|named| match named.parameter.options() {
            Some(options) => {
                remaining /= options.len() as f64;
                remaining_parameters -= 1;
                Some(options.len())
            }
            None => None,
        })
        .collect::<Vec<_>>();

    let per_parameter = if remaining_parameters == 0 {
        0
    } else {
        (remaining.max(0.0).powf(1.0 / remaining_parameters as f64) + ROOT_EPSILON).floor() as usize
    };

    counts
        .into_iter()
        .map(|count| count.unwrap_or(per_parameter))
        .collect()
}
