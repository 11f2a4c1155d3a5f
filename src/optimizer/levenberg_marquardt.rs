//! Levenberg-Marquardt algorithm implementation.
//!
//! The Levenberg-Marquardt algorithm interpolates between Gauss-Newton and gradient descent
//! by adding a damping term to the normal equations:
//!
//! ```text
//! (JᵀJ + λ D) δ = -Jᵀr,    D = diag(JᵀJ)  or  I
//! ```
//!
//! A candidate step is accepted only if it lowers the total error. On acceptance λ shrinks by
//! `lambda_factor`; on rejection (or a singular damped system) λ grows by the same factor and
//! the step is recomputed from the same linearization. The diagonal entries of `D` are clamped
//! to `[1e-6, 1e32]` so that variables without any Jacobian contribution still receive damping.

use super::{
    ConvergenceCriterion, Diagnostics, OptObserver, OptObserverVec, OptimizationStatus,
    OptimizerConfig, OptimizerType, Solver, check_convergence, check_limits, relative_change,
};
use crate::core::graph::{FactorGraph, LinearSystem};
use crate::core::values::Values;
use crate::error::{FailureReason, PoseGraphError, PoseGraphResult};
use crate::linalg::{LinAlgError, SparseLinearSolver, create_linear_solver};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;

/// Outcome of the damping loop of one outer iteration
enum StepOutcome {
    Accepted {
        values: Values,
        error: f64,
        step_norm: f64,
    },
    /// Rejected step too small to make further progress
    Stalled(ConvergenceCriterion),
}

/// Damping carried across outer iterations
#[derive(Debug, Clone, Copy)]
struct DampingState {
    lambda: f64,
    rejected_steps: usize,
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
#[derive(Debug, Default)]
pub struct LevenbergMarquardt {
    config: OptimizerConfig,
    observers: OptObserverVec,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config: OptimizerConfig {
                optimizer_type: OptimizerType::LevenbergMarquardt,
                ..config
            },
            observers: OptObserverVec::new(),
        }
    }

    /// Set the initial damping.
    pub fn with_damping(mut self, lambda: f64) -> Self {
        self.config.initial_lambda = lambda;
        self
    }

    /// Set the damping bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.config.lambda_min = min;
        self.config.lambda_max = max;
        self
    }

    /// Register an observer. Rejected steps are not reported.
    pub fn add_observer(&mut self, observer: Arc<dyn OptObserver>) {
        self.observers.add(observer);
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// `λ·clamp(diag(JᵀJ))`, or `λ·I` without diagonal scaling
    fn damping_diagonal(&self, system: &LinearSystem, lambda: f64) -> Vec<f64> {
        if self.config.diagonal_damping {
            system
                .column_norms_sq
                .iter()
                .map(|d| lambda * d.clamp(MIN_DIAGONAL, MAX_DIAGONAL))
                .collect()
        } else {
            vec![lambda; system.column_norms_sq.len()]
        }
    }

    /// Retry damped solves on one linearization until a step lowers the error.
    fn find_step(
        &self,
        graph: &FactorGraph,
        values: &Values,
        current_error: f64,
        damping_state: &mut DampingState,
        linear_solver: &mut dyn SparseLinearSolver,
        iteration: usize,
    ) -> PoseGraphResult<StepOutcome> {
        let config = &self.config;
        let system = graph.linearize(values)?;

        let mut retries = 0;
        loop {
            let lambda = damping_state.lambda;
            let damping = self.damping_diagonal(&system, lambda);
            let last_was_singular = match linear_solver.solve_augmented_equation(
                &system.residual,
                &system.jacobian,
                &damping,
            ) {
                Ok(solution) => {
                    let delta = system.delta_from_solution(&solution)?;
                    let step_norm = delta.norm();
                    let candidate = values.retract(&delta)?;
                    let candidate_error = graph.error(&candidate)?;

                    if candidate_error < current_error {
                        debug!(
                            "LM iteration {}: error {:.6e} -> {:.6e}, |δ| {:.3e}, λ {:.3e}",
                            iteration + 1,
                            current_error,
                            candidate_error,
                            step_norm,
                            lambda
                        );
                        damping_state.lambda =
                            (lambda / config.lambda_factor).max(config.lambda_min);
                        return Ok(StepOutcome::Accepted {
                            values: candidate,
                            error: candidate_error,
                            step_norm,
                        });
                    }

                    damping_state.rejected_steps += 1;
                    if step_norm < config.step_tolerance {
                        return Ok(StepOutcome::Stalled(ConvergenceCriterion::StepSize));
                    }
                    if candidate_error.is_finite()
                        && relative_change(current_error, candidate_error)
                            < config.relative_error_tol
                    {
                        return Ok(StepOutcome::Stalled(
                            ConvergenceCriterion::RelativeErrorDecrease,
                        ));
                    }
                    warn!(
                        "LM step rejected: error {:.6e} -> {:.6e} with lambda {:.3e}",
                        current_error, candidate_error, lambda
                    );
                    false
                }
                Err(LinAlgError::SingularMatrix(message)) => {
                    damping_state.rejected_steps += 1;
                    warn!(
                        "LM damped system singular with lambda {:.3e}: {}",
                        lambda, message
                    );
                    true
                }
                Err(other) => return Err(other.into()),
            };

            retries += 1;
            if retries >= config.max_lambda_retries {
                let reason = if last_was_singular {
                    FailureReason::SingularSystem
                } else {
                    FailureReason::LmRetriesExhausted
                };
                return Err(PoseGraphError::OptimizationFailed {
                    reason,
                    iterations: iteration,
                });
            }
            damping_state.lambda = (lambda * config.lambda_factor).min(config.lambda_max);
        }
    }
}

impl Solver for LevenbergMarquardt {
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
        let mut damping_state = DampingState {
            lambda: config.initial_lambda,
            rejected_steps: 0,
        };
        let mut iteration = 0;

        if config.verbose {
            info!(
                "Levenberg-Marquardt: {} factors, {} variables, {} solver, error {:.6e}, λ {:.1e}",
                graph.len(),
                values.len(),
                config.linear_solver_type,
                initial_error,
                damping_state.lambda
            );
        }

        let status = if initial_error <= config.absolute_error_tol {
            OptimizationStatus::Converged(ConvergenceCriterion::AbsoluteError)
        } else {
            loop {
                if config.is_cancelled() {
                    break OptimizationStatus::Cancelled;
                }

                let outcome = self.find_step(
                    graph,
                    &values,
                    current_error,
                    &mut damping_state,
                    linear_solver.as_mut(),
                    iteration,
                )?;
                let (next_values, next_error, step_norm) = match outcome {
                    StepOutcome::Accepted {
                        values,
                        error,
                        step_norm,
                    } => (values, error, step_norm),
                    StepOutcome::Stalled(criterion) => {
                        debug!("LM stalled at iteration {}: {}", iteration, criterion);
                        break OptimizationStatus::Converged(criterion);
                    }
                };

                values = next_values;
                let previous_error = current_error;
                current_error = next_error;
                error_history.push(current_error);
                iteration += 1;
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
            optimizer_type: OptimizerType::LevenbergMarquardt,
            iterations: iteration,
            initial_error,
            final_error: current_error,
            status,
            elapsed: start.elapsed(),
            error_history,
            final_lambda: Some(damping_state.lambda),
            rejected_steps: damping_state.rejected_steps,
        };
        if config.verbose {
            info!("{}", diagnostics);
        }
        Ok((values, diagnostics))
    }
}
