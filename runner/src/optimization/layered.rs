use super::{
    divisive::Divisive, store::OptimizationResultStore, MethodSpec, OptimizationError,
    OptimizationStrategy,
};
use crate::params::{NamedParameter, ParameterSet};
use std::collections::BTreeMap;
use tracing::info;

/// Successive divisive searches, each narrowed around the best set of the
/// previous layers.
#[derive(Clone, Debug)]
pub struct Layered {
    parameters: Vec<NamedParameter>,
    total: usize,
    layer_count: usize,
    current_layer: usize,
    remaining: usize,
    ranges: BTreeMap<String, (f64, f64)>,
    current: Option<Divisive>,
}

impl Layered {
    pub fn new(parameters: Vec<NamedParameter>, total: usize) -> Self {
        Self {
            parameters,
            total,
            layer_count: (total as f64).sqrt().floor() as usize,
            current_layer: 0,
            remaining: total,
            ranges: BTreeMap::new(),
            current: None,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn current_layer(&self) -> usize {
        self.current_layer
    }

    /// Range of a numeric parameter as used by the current layer.
    pub fn range(&self, name: &str) -> Option<(f64, f64)> {
        self.ranges.get(name).copied()
    }

    fn needs_next_layer(&self) -> bool {
        match self.current {
            None => true,
            Some(ref current) => !current.has_next() && self.current_layer < self.layer_count,
        }
    }

    fn next_layer_iterations(&mut self) -> usize {
        if self.current_layer + 1 >= self.layer_count {
            let iterations = self.remaining.max(1);
            self.remaining = 0;
            return iterations;
        }

        let mut budget = (self.remaining / 2).max(1) as f64;
        let mut free_parameters = self.parameters.len();
        let mut option_product = 1;

        for named in &self.parameters {
            if let Some(options) = named.parameter.options() {
                budget /= options.len() as f64;
                free_parameters -= 1;
                option_product *= options.len();
            }
        }

        let iterations = if free_parameters == 0 {
            option_product
        } else {
            let per_parameter = (budget.max(0.0).powf(1.0 / free_parameters as f64) + 1e-9).floor();
            per_parameter.powi(free_parameters as i32) as usize * option_product
        };

        self.remaining = self.remaining.saturating_sub(iterations);

        iterations
    }

    fn apply_next_layer(&mut self, store: &OptimizationResultStore, spec: &MethodSpec) -> Result<(), OptimizationError> {
        let optimum = store.optimum(&spec.criterion.name)?.map(|(set, _)| set.clone());
        let first_layer = self.current.is_none();

        let parameters = self
            .parameters
            .iter()
            .map(|named| {
                let Some((old_min, old_max)) = self.ranges.get(&named.name).copied() else {
                    return named.clone();
                };
                let optimum = optimum
                    .as_ref()
                    .and_then(|set| set.get(&named.name))
                    .and_then(|value| value.parse::<f64>().ok());

                match (first_layer, optimum, named.parameter.bounds()) {
                    (false, Some(optimum), Some(bounds)) => {
                        let (min, max) = narrow_range(optimum, (old_min, old_max), bounds);
                        self.ranges.insert(named.name.clone(), (min, max));

                        NamedParameter::new(named.name.clone(), named.parameter.with_bounds(min, max))
                    }
                    _ => NamedParameter::new(
                        named.name.clone(),
                        named.parameter.with_bounds(old_min, old_max),
                    ),
                }
            })
            .collect::<Vec<_>>();

        let iterations = self.next_layer_iterations();
        let mut divisive = Divisive::new(parameters, iterations);
        divisive.init();

        info!(
            layer = self.current_layer + 1,
            layers = self.layer_count,
            iterations,
            "Opening next layer for {}/{}",
            spec.program,
            spec.data
        );

        self.current = Some(divisive);
        self.current_layer += 1;

        Ok(())
    }
}

impl OptimizationStrategy for Layered {
    fn init_parameter_values(&mut self, _spec: &MethodSpec) -> Result<(), OptimizationError> {
        self.current_layer = 0;
        self.remaining = self.total;
        self.current = None;
        self.ranges = self
            .parameters
            .iter()
            .filter(|named| named.parameter.options().is_none())
            .filter_map(|named| named.parameter.bounds().map(|bounds| (named.name.clone(), bounds)))
            .collect();

        Ok(())
    }

    fn has_next(&self) -> bool {
        match self.current {
            Some(ref current) if current.has_next() => true,
            _ => self.current_layer < self.layer_count,
        }
    }

    fn next_parameter_set(
        &mut self,
        forced: Option<&ParameterSet>,
        store: &OptimizationResultStore,
        spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError> {
        if self.needs_next_layer() {
            if self.current_layer >= self.layer_count {
                return Err(OptimizationError::NoParameterSetFound(
                    "every layer was searched already".to_owned(),
                ));
            }

            self.apply_next_layer(store, spec)?;
        }

        match self.current {
            Some(ref mut current) => current.step(forced),
            None => Err(OptimizationError::NoParameterSetFound(
                "no layer is open".to_owned(),
            )),
        }
    }

    fn total_iteration_count(&self) -> usize {
        self.total
    }

    fn awaits_complete_feedback(&self) -> bool {
        self.needs_next_layer()
    }
}

/// Half of the old window centred on `optimum`, shifted back inside `bounds`.
pub fn narrow_range(optimum: f64, old: (f64, f64), bounds: (f64, f64)) -> (f64, f64) {
    let quarter = (old.1 - old.0) / 4.0;
    let (mut min, mut max) = (optimum - quarter, optimum + quarter);

    if min < bounds.0 {
        max += bounds.0 - min;
        min = bounds.0;
    } else if max > bounds.1 {
        min -= max - bounds.1;
        max = bounds.1;
    }

    (min.max(bounds.0), max.min(bounds.1))
}
