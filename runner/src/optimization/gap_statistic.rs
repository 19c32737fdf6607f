use super::{store::OptimizationResultStore, MethodSpec, OptimizationError, OptimizationStrategy};
use crate::{config::DataFormat, numeric::NumericBackend, params::ParameterSet};
use std::sync::Arc;
use tracing::info;

pub const MAX_CLUSTERS: usize = 10;
pub const BOOTSTRAPS: usize = 100;

/// Single shot estimate of the number of clusters `k`.
///
/// The value is recomputed on every request, replayed sets only advance the
/// counter.
#[derive(Debug, Clone)]
pub struct GapStatistic {
    numeric: Arc<dyn NumericBackend>,
    issued: usize,
}

impl GapStatistic {
    pub fn new(spec: &MethodSpec, numeric: Option<Arc<dyn NumericBackend>>) -> Result<Self, OptimizationError> {
        let numeric = numeric.ok_or_else(|| {
            OptimizationError::Incompatible("the gap statistic requires a numeric backend".to_owned())
        })?;

        if spec.data_format != DataFormat::Absolute {
            return Err(OptimizationError::Incompatible(format!(
                "the gap statistic requires absolute coordinates, data {} is {:?}",
                spec.data, spec.data_format
            )));
        }

        Ok(Self { numeric, issued: 0 })
    }
}

impl OptimizationStrategy for GapStatistic {
    fn init_parameter_values(&mut self, _spec: &MethodSpec) -> Result<(), OptimizationError> {
        self.issued = 0;
        Ok(())
    }

    fn has_next(&self) -> bool {
        self.issued < self.total_iteration_count()
    }

    fn next_parameter_set(
        &mut self,
        _forced: Option<&ParameterSet>,
        _store: &OptimizationResultStore,
        spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError> {
        self.issued += 1;

        let clusters = self
            .numeric
            .gap_statistic(&spec.data_path, MAX_CLUSTERS, BOOTSTRAPS)?;
        info!(clusters, "Gap statistic for {}", spec.data);

        let mut set = ParameterSet::new();
        set.insert("k", clusters.to_string());

        Ok(set)
    }

    fn total_iteration_count(&self) -> usize {
        1
    }
}
