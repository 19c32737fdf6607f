use super::{
    diverging::{Diverging, DEFAULT_TRIES_ON_NOT_TERMINATED},
    divisive::Divisive,
    gap_statistic::GapStatistic,
    layered::Layered,
    MethodSpec, OptimizationError, OptimizationMethod, OptimizationStrategy,
};
use crate::numeric::NumericBackend;
use once_cell::sync::Lazy;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

pub type StrategyFactory = fn(
    &MethodSpec,
    Option<Arc<dyn NumericBackend>>,
) -> Result<Box<dyn OptimizationStrategy>, OptimizationError>;

static STRATEGIES: Lazy<BTreeMap<&'static str, StrategyFactory>> = Lazy::new(|| {
    let mut strategies: BTreeMap<&'static str, StrategyFactory> = BTreeMap::new();

    strategies.insert("divisive", |spec, _| {
        Ok(Box::new(Divisive::new(spec.parameters.clone(), spec.iterations)))
    });
    strategies.insert("layered_divisive", |spec, _| {
        Ok(Box::new(Layered::new(spec.parameters.clone(), spec.iterations)))
    });
    strategies.insert("ap_divisive", |spec, _| {
        Ok(Box::new(Diverging::new(
            spec.parameters.clone(),
            spec.iterations,
            DEFAULT_TRIES_ON_NOT_TERMINATED,
        )?))
    });
    strategies.insert("gap_statistic", |spec, numeric| {
        Ok(Box::new(GapStatistic::new(spec, numeric)?))
    });

    strategies
});

/// Names of all known strategies, sorted.
pub fn strategy_names() -> Vec<&'static str> {
    STRATEGIES.keys().copied().collect()
}

pub fn is_known(name: &str) -> bool {
    STRATEGIES.contains_key(name.to_lowercase().as_str())
}

pub fn create_strategy(
    name: &str,
    spec: &MethodSpec,
    numeric: Option<Arc<dyn NumericBackend>>,
) -> Result<Box<dyn OptimizationStrategy>, OptimizationError> {
    let factory = STRATEGIES
        .get(name.to_lowercase().as_str())
        .ok_or_else(|| OptimizationError::UnknownMethod(name.to_owned()))?;

    debug!(strategy = name, "Creating optimization strategy for {}/{}", spec.program, spec.data);

    factory(spec, numeric)
}

pub fn create_method(
    name: &str,
    spec: MethodSpec,
    numeric: Option<Arc<dyn NumericBackend>>,
) -> Result<OptimizationMethod, OptimizationError> {
    let strategy = create_strategy(name, &spec, numeric)?;

    Ok(OptimizationMethod::new(spec, strategy))
}
