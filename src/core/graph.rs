use crate::core::key::Key;
use crate::core::values::{Delta, Values};
use crate::error::{PoseGraphError, PoseGraphResult};
use crate::factors::{Factor, LinearizedFactor};
use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Statistics about a factor graph
#[derive(Debug, Clone)]
pub struct FactorGraphStatistics {
    pub num_variables: usize,
    pub num_factors: usize,
    pub total_manifold_dimension: usize,
    pub total_residual_dimension: usize,
}

impl fmt::Display for FactorGraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FactorGraph Statistics:\n\
             Variables: {}\n\
             Factors: {}\n\
             Manifold dimension: {}\n\
             Residual dimension: {}",
            self.num_variables,
            self.num_factors,
            self.total_manifold_dimension,
            self.total_residual_dimension
        )
    }
}

/// Column layout of the linear system: each referenced key owns a contiguous block of
/// columns, assigned in ascending key order.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableOrdering {
    offsets: BTreeMap<Key, (usize, usize)>,
    total_dof: usize,
}

impl VariableOrdering {
    pub fn new(keys: &BTreeSet<Key>, values: &Values) -> PoseGraphResult<Self> {
        let mut offsets = BTreeMap::new();
        let mut total_dof = 0;
        for key in keys {
            let dof = values.at(*key)?.dof();
            offsets.insert(*key, (total_dof, dof));
            total_dof += dof;
        }
        Ok(VariableOrdering { offsets, total_dof })
    }

    /// First column and tangent size of `key`
    pub fn block(&self, key: Key) -> Option<(usize, usize)> {
        self.offsets.get(&key).copied()
    }

    pub fn total_dof(&self) -> usize {
        self.total_dof
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.offsets.keys().copied()
    }
}

/// Whitened least-squares system `min ‖J δ + r‖²` at one linearization point.
///
/// Lives for a single optimizer iteration.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub ordering: VariableOrdering,
    pub jacobian: SparseColMat<usize, f64>,
    /// Stacked whitened residual, a single column
    pub residual: Mat<f64>,
    /// Squared column norms of the Jacobian, i.e. `diag(JᵀJ)`
    pub column_norms_sq: Vec<f64>,
    /// Total error at the linearization point
    pub error: f64,
}

impl LinearSystem {
    /// Split a stacked solution column into per-key tangent steps.
    pub fn delta_from_solution(&self, solution: &Mat<f64>) -> PoseGraphResult<Delta> {
        if solution.nrows() != self.ordering.total_dof() || solution.ncols() != 1 {
            return Err(PoseGraphError::LinearAlgebra(format!(
                "solution has shape {}x{}, expected {}x1",
                solution.nrows(),
                solution.ncols(),
                self.ordering.total_dof()
            )));
        }
        let mut delta = Delta::new();
        for (key, (offset, dof)) in &self.ordering.offsets {
            delta.insert(
                *key,
                DVector::from_fn(*dof, |i, _| solution[(offset + i, 0)]),
            );
        }
        Ok(delta)
    }
}

/// Ordered collection of factors.
///
/// Factors are immutable and shared through `Arc`, so cloning a graph is cheap and the clone
/// has no mutable state in common with the original.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: Vec<Arc<dyn Factor>>,
    keys: BTreeSet<Key>,
}

impl FactorGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factor and return its index.
    pub fn add(&mut self, factor: impl Factor) -> usize {
        self.add_shared(Arc::new(factor))
    }

    /// Append a factor that is already shared, e.g. between several graphs.
    pub fn add_shared(&mut self, factor: Arc<dyn Factor>) -> usize {
        self.keys.extend(factor.keys().iter().copied());
        self.factors.push(factor);
        self.factors.len() - 1
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn factor(&self, index: usize) -> Option<&dyn Factor> {
        self.factors.get(index).map(|factor| factor.as_ref())
    }

    pub fn factors(&self) -> impl Iterator<Item = &dyn Factor> {
        self.factors.iter().map(|factor| factor.as_ref())
    }

    /// Every key referenced by at least one factor, ascending
    pub fn keys(&self) -> &BTreeSet<Key> {
        &self.keys
    }

    pub fn residual_dimension(&self) -> usize {
        self.factors.iter().map(|factor| factor.dimension()).sum()
    }

    /// Counts of factors, variables and degrees of freedom, for logging before a run.
    pub fn statistics(&self, values: &Values) -> FactorGraphStatistics {
        FactorGraphStatistics {
            num_variables: self.keys.len(),
            num_factors: self.factors.len(),
            total_manifold_dimension: self
                .keys
                .iter()
                .filter_map(|key| values.at(*key).ok())
                .map(|variable| variable.dof())
                .sum(),
            total_residual_dimension: self.residual_dimension(),
        }
    }

    /// Check that every referenced key has a value.
    ///
    /// # Errors
    /// `MissingVariable` naming the first offending factor (by index) and key.
    pub fn validate(&self, values: &Values) -> PoseGraphResult<()> {
        for (index, factor) in self.factors.iter().enumerate() {
            if let Some(key) = factor.keys().iter().find(|key| !values.contains(**key)) {
                return Err(PoseGraphError::MissingVariable {
                    key: *key,
                    factor: index,
                });
            }
        }
        Ok(())
    }

    /// Total error: the sum of every factor's error.
    ///
    /// Factors are evaluated in parallel and summed in insertion order, so the result does not
    /// depend on thread scheduling.
    pub fn error(&self, values: &Values) -> PoseGraphResult<f64> {
        self.validate(values)?;
        let errors = self
            .factors
            .par_iter()
            .map(|factor| factor.error(values))
            .collect::<PoseGraphResult<Vec<f64>>>()?;
        Ok(errors.iter().sum())
    }

    /// Build the sparse whitened Jacobian and residual at `values`.
    ///
    /// Rows follow factor insertion order; columns follow [`VariableOrdering`]. `values` is
    /// only read.
    pub fn linearize(&self, values: &Values) -> PoseGraphResult<LinearSystem> {
        self.validate(values)?;
        let ordering = VariableOrdering::new(&self.keys, values)?;

        let linearized = self
            .factors
            .par_iter()
            .map(|factor| factor.linearize(values))
            .collect::<PoseGraphResult<Vec<LinearizedFactor>>>()?;

        let num_rows = self.residual_dimension();
        let num_cols = ordering.total_dof();
        let nnz: usize = linearized
            .iter()
            .map(|lf| lf.jacobians.iter().map(|j| j.len()).sum::<usize>())
            .sum();

        let mut triplets = Vec::with_capacity(nnz);
        let mut residual = Vec::with_capacity(num_rows);
        let mut column_norms_sq = vec![0.0; num_cols];
        let mut error = 0.0;
        let mut row = 0;

        for factor in &linearized {
            for (key, block) in factor.keys.iter().zip(&factor.jacobians) {
                let (col, dof) = ordering
                    .block(*key)
                    .ok_or(PoseGraphError::KeyNotFound(*key))?;
                if block.ncols() != dof || block.nrows() != factor.residual.len() {
                    return Err(PoseGraphError::DimensionMismatch {
                        key: *key,
                        expected: format!("{}x{dof} Jacobian block", factor.residual.len()),
                        found: format!("{}x{}", block.nrows(), block.ncols()),
                    });
                }
                for c in 0..dof {
                    for r in 0..block.nrows() {
                        let value = block[(r, c)];
                        triplets.push(Triplet::new(row + r, col + c, value));
                        column_norms_sq[col + c] += value * value;
                    }
                }
            }
            residual.extend_from_slice(factor.residual.as_slice());
            error += factor.error;
            row += factor.residual.len();
        }

        let jacobian = SparseColMat::try_new_from_triplets(num_rows, num_cols, &triplets)
            .map_err(|e| {
                PoseGraphError::LinearAlgebra(format!("Failed to create sparse Jacobian: {e:?}"))
            })?;
        let residual = Mat::from_fn(num_rows, 1, |i, _| residual[i]);

        Ok(LinearSystem {
            ordering,
            jacobian,
            residual,
            column_norms_sq,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::noise::GaussianNoise;
    use crate::factors::{BetweenFactor, PriorFactor};
    use crate::manifold::{LieGroup, SE2};
    use approx::assert_relative_eq;

    fn chain() -> (FactorGraph, Values) {
        let mut graph = FactorGraph::new();
        graph.add(PriorFactor::new(Key(0), SE2::identity(), GaussianNoise::identity(3)).unwrap());
        graph.add(
            BetweenFactor::new(
                Key(0),
                Key(1),
                SE2::from_xy_angle(1.0, 0.0, 0.0),
                GaussianNoise::identity(3),
            )
            .unwrap(),
        );
        graph.add(
            BetweenFactor::new(
                Key(1),
                Key(2),
                SE2::from_xy_angle(1.0, 0.0, 0.0),
                GaussianNoise::identity(3),
            )
            .unwrap(),
        );

        let mut values = Values::new();
        values.insert(Key(0), SE2::identity()).unwrap();
        values.insert(Key(1), SE2::from_xy_angle(1.1, 0.0, 0.0)).unwrap();
        values.insert(Key(2), SE2::from_xy_angle(2.0, 0.1, 0.0)).unwrap();
        (graph, values)
    }

    #[test]
    fn test_keys_and_dimensions() {
        let (graph, values) = chain();
        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.keys().iter().copied().collect::<Vec<_>>(),
            vec![Key(0), Key(1), Key(2)]
        );
        assert_eq!(graph.residual_dimension(), 9);
        let stats = graph.statistics(&values);
        assert_eq!(stats.total_manifold_dimension, 9);
    }

    #[test]
    fn test_error_matches_factor_sum() {
        let (graph, values) = chain();
        let expected: f64 = graph.factors().map(|f| f.error(&values).unwrap()).sum();
        assert_relative_eq!(graph.error(&values).unwrap(), expected, epsilon = 1e-15);
        assert!(expected > 0.0);
    }

    #[test]
    fn test_linearize_shapes_and_offsets() {
        let (graph, values) = chain();
        let system = graph.linearize(&values).unwrap();

        assert_eq!(system.jacobian.nrows(), 9);
        assert_eq!(system.jacobian.ncols(), 9);
        assert_eq!(system.residual.nrows(), 9);
        assert_eq!(system.ordering.block(Key(2)), Some((6, 3)));
        assert_relative_eq!(system.error, graph.error(&values).unwrap(), epsilon = 1e-15);

        // prior touches only the first block column
        let dense = system.jacobian.to_dense();
        for c in 3..9 {
            for r in 0..3 {
                assert_eq!(dense[(r, c)], 0.0);
            }
        }
        for c in 0..9 {
            let norm_sq: f64 = (0..9).map(|r| dense[(r, c)] * dense[(r, c)]).sum();
            assert_relative_eq!(system.column_norms_sq[c], norm_sq, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_delta_from_solution() {
        let (graph, values) = chain();
        let system = graph.linearize(&values).unwrap();
        let solution = Mat::from_fn(9, 1, |i, _| i as f64);
        let delta = system.delta_from_solution(&solution).unwrap();
        assert_eq!(delta.len(), 3);
        assert_eq!(delta.get(Key(1)).unwrap().as_slice(), &[3.0, 4.0, 5.0]);

        let wrong = Mat::<f64>::zeros(4, 1);
        assert!(system.delta_from_solution(&wrong).is_err());
    }

    #[test]
    fn test_missing_variable_reported_with_factor_index() {
        let (graph, mut values) = chain();
        values = values
            .iter()
            .filter(|(key, _)| *key != Key(2))
            .map(|(key, value)| (key, value.clone()))
            .collect();
        let before = values.clone();

        let result = graph.linearize(&values);
        assert!(matches!(
            result,
            Err(PoseGraphError::MissingVariable {
                key: Key(2),
                factor: 2
            })
        ));
        assert_eq!(values, before);
        assert!(graph.error(&values).is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let (graph, _) = chain();
        let mut copy = graph.clone();
        copy.add(PriorFactor::new(Key(5), SE2::identity(), GaussianNoise::identity(3)).unwrap());
        assert_eq!(graph.len(), 3);
        assert_eq!(copy.len(), 4);
        assert!(!graph.keys().contains(&Key(5)));
    }
}
