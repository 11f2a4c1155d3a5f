//! Gauss-Newton algorithm implementation.
//!
//! Each iteration solves the normal equations `JᵀJ δ = -Jᵀr` of the linearized graph and
//! applies the step unconditionally. Convergence is quadratic near the minimum, but there is no
//! safeguard against a rank-deficient system: an unanchored graph fails with
//! [`PoseGraphError::SingularSystem`](crate::error::PoseGraphError::SingularSystem).

use super::{
    Diagnostics, OptObserver, OptObserverVec, OptimizationStatus, OptimizerConfig, OptimizerType,
    Solver, check_convergence, check_limits,
};
use crate::core::graph::FactorGraph;
use crate::core::values::Values;
use crate::error::PoseGraphResult;
use crate::linalg::create_linear_solver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Gauss-Newton solver for nonlinear least squares optimization.
#[derive(Debug, Default)]
pub struct GaussNewton {
    config: OptimizerConfig,
    observers: OptObserverVec,
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    ///
    /// The optimizer type in `config` is forced to [`OptimizerType::GaussNewton`]; the
    /// damping fields are kept but never read.
    ///
    /// # Example
    ///
    /// ```
    /// use posegraph::LinearSolverType;
    /// use posegraph::optimizer::{GaussNewton, OptimizerConfig, OptimizerType};
    ///
    /// let config = OptimizerConfig::new().with_linear_solver_type(LinearSolverType::SparseQR);
    /// let solver = GaussNewton::with_config(config);
    /// assert_eq!(solver.config().optimizer_type, OptimizerType::GaussNewton);
    /// ```
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config: OptimizerConfig {
                optimizer_type: OptimizerType::GaussNewton,
                ..config
            },
            observers: OptObserverVec::new(),
        }
    }

    /// Register an observer called with the values after every accepted step.
    ///
    /// Observers run on the optimizer thread, in registration order.
    pub fn add_observer(&mut self, observer: Arc<dyn OptObserver>) {
        self.observers.add(observer);
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl Solver for GaussNewton {
    fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial_values: Values,
    ) -> PoseGraphResult<(Values, Diagnostics)> {
        let config = &self.config;
        config.validate()?;
        let start = Instant::now();
        let mut linear_solver =
            create_linear_solver(config.linear_solver_type, config.singularity_tolerance);

        let mut values = initial_values;
        let initial_error = graph.error(&values)?;
        let mut current_error = initial_error;
        let mut error_history = vec![initial_error];
        let mut iteration = 0;

        if config.verbose {
            info!(
                "Gauss-Newton: {} factors, {} variables, {} solver, initial error {:.6e}",
                graph.len(),
                values.len(),
                config.linear_solver_type,
                initial_error
            );
        }

        let status = if initial_error <= config.absolute_error_tol {
            OptimizationStatus::Converged(super::ConvergenceCriterion::AbsoluteError)
        } else {
            loop {
                if config.is_cancelled() {
                    break OptimizationStatus::Cancelled;
                }

                let system = graph.linearize(&values)?;
                let solution =
                    linear_solver.solve_normal_equation(&system.residual, &system.jacobian)?;
                let delta = system.delta_from_solution(&solution)?;
                let step_norm = delta.norm();

                values = values.retract(&delta)?;
                let previous_error = current_error;
                current_error = graph.error(&values)?;
                error_history.push(current_error);
                iteration += 1;

                debug!(
                    "GN iteration {}: error {:.6e} -> {:.6e}, step norm {:.3e}",
                    iteration, previous_error, current_error, step_norm
                );
                self.observers.notify(&values, iteration);

                if let Some(criterion) =
                    check_convergence(config, previous_error, current_error, step_norm)
                {
                    break OptimizationStatus::Converged(criterion);
                }
                if let Some(status) = check_limits(config, iteration, start) {
                    break status;
                }
            }
        };

        let diagnostics = Diagnostics {
            optimizer_type: OptimizerType::GaussNewton,
            iterations: iteration,
            initial_error,
            final_error: current_error,
            status,
            elapsed: start.elapsed(),
            error_history,
            final_lambda: None,
            rejected_steps: 0,
        };
        if config.verbose {
            info!("{}", diagnostics);
        }
        Ok((values, diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::Key;
    use crate::error::PoseGraphError;
    use crate::linalg::LinearSolverType;
    use crate::manifold::SE2;
    use crate::optimizer::ConvergenceCriterion;
    use crate::optimizer::test_utils::{RecordingObserver, se2_square, single_prior};
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_single_prior_one_iteration() {
        let (graph, values) = single_prior();
        let (result, diagnostics) = GaussNewton::new().optimize(&graph, values).unwrap();

        assert_eq!(diagnostics.iterations, 1);
        assert_eq!(
            diagnostics.status,
            OptimizationStatus::Converged(ConvergenceCriterion::AbsoluteError)
        );
        let pose = result.get::<SE2>(Key(0)).unwrap();
        assert_relative_eq!(pose.x(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(pose.y(), -2.0, epsilon = 1e-9);
        assert_relative_eq!(pose.angle(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_square_loop_both_solvers() {
        for solver_type in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
            let (graph, values) = se2_square(true);
            let config = OptimizerConfig::default().with_linear_solver_type(solver_type);
            let (result, diagnostics) = GaussNewton::with_config(config)
                .optimize(&graph, values)
                .unwrap();

            assert!(diagnostics.status.is_converged(), "{solver_type}");
            assert!(diagnostics.final_error < 1e-10);
            let corner = result.get::<SE2>(Key(2)).unwrap();
            assert_relative_eq!(corner.x(), 1.0, epsilon = 1e-6);
            assert_relative_eq!(corner.y(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_missing_prior_is_singular() {
        let (graph, values) = se2_square(false);
        let result = GaussNewton::new().optimize(&graph, values);
        assert!(matches!(result, Err(PoseGraphError::SingularSystem(_))));
    }

    #[test]
    fn test_observer_sees_every_step() {
        let (graph, values) = se2_square(true);
        let observer = Arc::new(RecordingObserver::default());
        let mut solver = GaussNewton::new();
        solver.add_observer(observer.clone());
        let (_, diagnostics) = solver.optimize(&graph, values).unwrap();

        let seen = observer.iterations();
        assert_eq!(seen.len(), diagnostics.iterations);
        assert_eq!(seen, (1..=diagnostics.iterations).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let (graph, values) = se2_square(true);
        let flag = Arc::new(AtomicBool::new(true));
        let config = OptimizerConfig::default().with_cancel_flag(flag);
        let (result, diagnostics) = GaussNewton::with_config(config)
            .optimize(&graph, values.clone())
            .unwrap();

        assert_eq!(diagnostics.status, OptimizationStatus::Cancelled);
        assert_eq!(diagnostics.iterations, 0);
        assert_eq!(result, values);
    }

    #[test]
    fn test_iteration_ceiling() {
        let (graph, values) = se2_square(true);
        let config = OptimizerConfig::default().with_max_iterations(1);
        let (_, diagnostics) = GaussNewton::with_config(config)
            .optimize(&graph, values)
            .unwrap();
        assert_eq!(diagnostics.iterations, 1);
        assert_eq!(diagnostics.status, OptimizationStatus::MaxIterationsReached);
        assert!(diagnostics.ensure_converged().is_err());
    }
}
