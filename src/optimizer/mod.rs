//! Nonlinear least-squares optimizers over a [`FactorGraph`].
//!
//! Two iterative solvers share one configuration and one result type:
//! - Gauss-Newton: undamped steps, fails fast on a singular system
//! - Levenberg-Marquardt: adaptive damping with step rejection
//!
//! Both minimise `Σ ½‖R r‖²` by repeated linearization, a sparse linear solve and a retraction of
//! the values along the resulting tangent step. The free function [`optimize`] selects the solver
//! from [`OptimizerConfig::optimizer_type`].

use crate::core::graph::FactorGraph;
use crate::core::values::Values;
use crate::error::{FailureReason, PoseGraphError, PoseGraphResult};
use crate::linalg::{DEFAULT_SINGULARITY_TOLERANCE, LinearSolverType};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub mod gauss_newton;
pub mod levenberg_marquardt;

pub use gauss_newton::GaussNewton;
pub use levenberg_marquardt::LevenbergMarquardt;

/// Type of optimization solver algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// Optimizer configuration shared by both solvers.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Type of optimizer algorithm to use
    pub optimizer_type: OptimizerType,
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of accepted steps
    pub max_iterations: usize,
    /// Stop when `|e_prev - e_curr| / e_prev` falls below this value
    pub relative_error_tol: f64,
    /// Stop when the total error falls below this value
    pub absolute_error_tol: f64,
    /// Stop when the norm of an accepted step falls below this value
    pub step_tolerance: f64,
    /// Wall-clock limit, checked after every accepted step
    pub timeout: Option<Duration>,
    /// Initial Levenberg-Marquardt damping
    pub initial_lambda: f64,
    /// Multiplier applied to λ on rejection and divisor on acceptance
    pub lambda_factor: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    /// Consecutive rejected steps tolerated before giving up
    pub max_lambda_retries: usize,
    /// Scale damping by `diag(JᵀJ)` instead of the identity
    pub diagonal_damping: bool,
    /// Reconstruction tolerance used by the linear solvers to flag singular systems
    pub singularity_tolerance: f64,
    /// Log start and termination at INFO level
    pub verbose: bool,
    /// Cooperative cancellation, checked once per outer iteration
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::default(),
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 100,
            relative_error_tol: 1e-5,
            absolute_error_tol: 1e-12,
            step_tolerance: 1e-10,
            timeout: None,
            initial_lambda: 1e-5,
            lambda_factor: 10.0,
            lambda_min: 1e-12,
            lambda_max: 1e10,
            max_lambda_retries: 10,
            diagonal_damping: true,
            singularity_tolerance: DEFAULT_SINGULARITY_TOLERANCE,
            verbose: false,
            cancel_flag: None,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer_type(mut self, optimizer_type: OptimizerType) -> Self {
        self.optimizer_type = optimizer_type;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_relative_error_tol(mut self, tolerance: f64) -> Self {
        self.relative_error_tol = tolerance;
        self
    }

    pub fn with_absolute_error_tol(mut self, tolerance: f64) -> Self {
        self.absolute_error_tol = tolerance;
        self
    }

    pub fn with_step_tolerance(mut self, tolerance: f64) -> Self {
        self.step_tolerance = tolerance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }

    /// Set the damping update factor and its bounds
    pub fn with_lambda_schedule(mut self, factor: f64, min: f64, max: f64) -> Self {
        self.lambda_factor = factor;
        self.lambda_min = min;
        self.lambda_max = max;
        self
    }

    pub fn with_max_lambda_retries(mut self, retries: usize) -> Self {
        self.max_lambda_retries = retries;
        self
    }

    pub fn with_diagonal_damping(mut self, diagonal_damping: bool) -> Self {
        self.diagonal_damping = diagonal_damping;
        self
    }

    pub fn with_singularity_tolerance(mut self, tolerance: f64) -> Self {
        self.singularity_tolerance = tolerance;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Reject tolerances and damping settings the solvers cannot work with.
    pub fn validate(&self) -> PoseGraphResult<()> {
        if self.max_iterations == 0 {
            return Err(PoseGraphError::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let non_negative = [
            ("relative_error_tol", self.relative_error_tol),
            ("absolute_error_tol", self.absolute_error_tol),
            ("step_tolerance", self.step_tolerance),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(PoseGraphError::InvalidInput(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if !(self.singularity_tolerance > 0.0) {
            return Err(PoseGraphError::InvalidInput(format!(
                "singularity_tolerance must be positive, got {}",
                self.singularity_tolerance
            )));
        }
        if self.optimizer_type == OptimizerType::LevenbergMarquardt {
            if !(self.lambda_factor > 1.0) {
                return Err(PoseGraphError::InvalidInput(format!(
                    "lambda_factor must exceed 1, got {}",
                    self.lambda_factor
                )));
            }
            if !(0.0 < self.lambda_min
                && self.lambda_min <= self.lambda_max
                && self.lambda_max.is_finite())
            {
                return Err(PoseGraphError::InvalidInput(format!(
                    "invalid damping bounds [{}, {}]",
                    self.lambda_min, self.lambda_max
                )));
            }
            if !(self.initial_lambda > 0.0 && self.initial_lambda.is_finite()) {
                return Err(PoseGraphError::InvalidInput(format!(
                    "initial_lambda must be positive, got {}",
                    self.initial_lambda
                )));
            }
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Criterion that ended a converged run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    /// Total error below `absolute_error_tol`
    AbsoluteError,
    /// Relative error change below `relative_error_tol`
    RelativeErrorDecrease,
    /// Step norm below `step_tolerance`
    StepSize,
}

impl fmt::Display for ConvergenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceCriterion::AbsoluteError => write!(f, "absolute error tolerance reached"),
            ConvergenceCriterion::RelativeErrorDecrease => {
                write!(f, "relative error decrease tolerance reached")
            }
            ConvergenceCriterion::StepSize => write!(f, "step size tolerance reached"),
        }
    }
}

/// Status of an optimization process that returned values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    Converged(ConvergenceCriterion),
    MaxIterationsReached,
    Timeout,
    Cancelled,
}

impl OptimizationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, OptimizationStatus::Converged(_))
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged(criterion) => write!(f, "Converged ({criterion})"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Summary of an optimization run.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub optimizer_type: OptimizerType,
    /// Number of accepted steps
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub status: OptimizationStatus,
    pub elapsed: Duration,
    /// Error after every accepted state, starting with the initial error
    pub error_history: Vec<f64>,
    /// Damping at termination (Levenberg-Marquardt only)
    pub final_lambda: Option<f64>,
    /// Candidate steps discarded by Levenberg-Marquardt
    pub rejected_steps: usize,
}

impl Diagnostics {
    /// Wall time divided by the accepted steps, or the whole run when none was accepted.
    pub fn time_per_iteration(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed.as_secs_f64() / self.iterations.max(1) as f64)
    }

    pub fn termination_reason(&self) -> OptimizationStatus {
        self.status
    }

    /// Turn a run that hit the iteration ceiling into an error.
    pub fn ensure_converged(self) -> PoseGraphResult<Self> {
        match self.status {
            OptimizationStatus::MaxIterationsReached => Err(PoseGraphError::OptimizationFailed {
                reason: FailureReason::MaxIterationsReached,
                iterations: self.iterations,
            }),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} Optimization Summary ===", self.optimizer_type)?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Initial error:             {:.6e}", self.initial_error)?;
        writeln!(f, "Final error:               {:.6e}", self.final_error)?;
        writeln!(
            f,
            "Error reduction:           {:.6e} ({:.2}%)",
            self.initial_error - self.final_error,
            100.0 * (self.initial_error - self.final_error) / self.initial_error.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        if let Some(lambda) = self.final_lambda {
            writeln!(f, "Rejected steps:            {}", self.rejected_steps)?;
            writeln!(f, "Final damping parameter:   {lambda:.6e}")?;
        }
        writeln!(f, "Total time:                {:?}", self.elapsed)?;
        writeln!(
            f,
            "Average time per iteration: {:?}",
            self.time_per_iteration()
        )
    }
}

/// Callback invoked with the values after every accepted step
pub trait OptObserver: Send + Sync {
    fn on_step(&self, values: &Values, iteration: usize);
}

/// Ordered collection of observers
#[derive(Default, Clone)]
pub struct OptObserverVec {
    observers: Vec<Arc<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; observers run in insertion order.
    pub fn add(&mut self, observer: Arc<dyn OptObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Call every observer with the newly accepted values.
    pub fn notify(&self, values: &Values, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(values, iteration);
        }
    }
}

impl fmt::Debug for OptObserverVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptObserverVec")
            .field("len", &self.observers.len())
            .finish()
    }
}

/// Core trait for optimization solvers.
pub trait Solver {
    /// Minimise the graph error starting from `initial_values`.
    ///
    /// Returns the last accepted values with the run diagnostics. Failures that leave no
    /// usable estimate (singular Gauss-Newton system, exhausted damping retries, missing
    /// variables) are errors.
    fn optimize(
        &mut self,
        graph: &FactorGraph,
        initial_values: Values,
    ) -> PoseGraphResult<(Values, Diagnostics)>;
}

/// Optimize `graph` from `initial_values` with the solver selected by `config`.
///
/// # Example
///
/// ```
/// use posegraph::core::{graph::FactorGraph, key::Key, noise::GaussianNoise, values::Values};
/// use posegraph::factors::PriorFactor;
/// use posegraph::manifold::SE2;
/// use posegraph::optimizer::{OptimizerConfig, optimize};
///
/// let mut graph = FactorGraph::new();
/// let target = SE2::from_xy_angle(1.0, 2.0, 0.3);
/// graph.add(PriorFactor::new(Key(0), target, GaussianNoise::identity(3)).unwrap());
///
/// let mut values = Values::new();
/// values.insert(Key(0), SE2::from_xy_angle(0.0, 0.0, 0.0)).unwrap();
///
/// let (result, diagnostics) = optimize(&graph, values, &OptimizerConfig::default()).unwrap();
/// assert!(diagnostics.status.is_converged());
/// assert!((result.get::<SE2>(Key(0)).unwrap().x() - 1.0).abs() < 1e-6);
/// ```
pub fn optimize(
    graph: &FactorGraph,
    initial_values: Values,
    config: &OptimizerConfig,
) -> PoseGraphResult<(Values, Diagnostics)> {
    match config.optimizer_type {
        OptimizerType::GaussNewton => {
            GaussNewton::with_config(config.clone()).optimize(graph, initial_values)
        }
        OptimizerType::LevenbergMarquardt => {
            LevenbergMarquardt::with_config(config.clone()).optimize(graph, initial_values)
        }
    }
}

/// Convergence test applied after an accepted step, in order: absolute floor, relative
/// decrease, step size.
fn check_convergence(
    config: &OptimizerConfig,
    previous_error: f64,
    current_error: f64,
    step_norm: f64,
) -> Option<ConvergenceCriterion> {
    if current_error <= config.absolute_error_tol {
        return Some(ConvergenceCriterion::AbsoluteError);
    }
    if relative_change(previous_error, current_error) < config.relative_error_tol {
        return Some(ConvergenceCriterion::RelativeErrorDecrease);
    }
    if step_norm < config.step_tolerance {
        return Some(ConvergenceCriterion::StepSize);
    }
    None
}

/// Iteration ceiling and timeout, checked after the convergence test.
fn check_limits(
    config: &OptimizerConfig,
    iteration: usize,
    start: Instant,
) -> Option<OptimizationStatus> {
    if iteration >= config.max_iterations {
        return Some(OptimizationStatus::MaxIterationsReached);
    }
    if let Some(timeout) = config.timeout
        && start.elapsed() >= timeout
    {
        return Some(OptimizationStatus::Timeout);
    }
    None
}

fn relative_change(previous_error: f64, current_error: f64) -> f64 {
    if previous_error > 0.0 {
        (previous_error - current_error).abs() / previous_error
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::core::key::Key;
    use crate::core::noise::GaussianNoise;
    use crate::factors::{BetweenFactor, PriorFactor};
    use crate::manifold::{LieGroup, SE2};
    use std::f64::consts::FRAC_PI_2;
    use std::sync::Mutex;

    /// One SE(2) pose pulled towards `(1, -2, 0.5)` from the origin.
    pub fn single_prior() -> (FactorGraph, Values) {
        let mut graph = FactorGraph::new();
        graph.add(
            PriorFactor::new(
                Key(0),
                SE2::from_xy_angle(1.0, -2.0, 0.5),
                GaussianNoise::identity(3),
            )
            .unwrap(),
        );
        let mut values = Values::new();
        values.insert(Key(0), SE2::identity()).unwrap();
        (graph, values)
    }

    /// Unit square of four poses turning left at every corner, closed by a loop edge.
    /// The initial guess is perturbed away from the exact corners.
    pub fn se2_square(with_prior: bool) -> (FactorGraph, Values) {
        let mut graph = FactorGraph::new();
        if with_prior {
            graph.add(
                PriorFactor::new(
                    Key(0),
                    SE2::identity(),
                    GaussianNoise::from_scalar_sigma(3, 0.01).unwrap(),
                )
                .unwrap(),
            );
        }
        let odometry = SE2::from_xy_angle(1.0, 0.0, FRAC_PI_2);
        for (i, j) in [(0, 1), (1, 2), (2, 3), (3, 0)] {
            graph.add(
                BetweenFactor::new(Key(i), Key(j), odometry.clone(), GaussianNoise::identity(3))
                    .unwrap(),
            );
        }

        let mut values = Values::new();
        let guesses = [
            (0.1, -0.1, 0.05),
            (1.2, 0.1, FRAC_PI_2 - 0.1),
            (0.9, 1.2, std::f64::consts::PI + 0.15),
            (-0.15, 0.9, -FRAC_PI_2 + 0.1),
        ];
        for (k, (x, y, theta)) in guesses.into_iter().enumerate() {
            values
                .insert(Key(k as u64), SE2::from_xy_angle(x, y, theta))
                .unwrap();
        }
        (graph, values)
    }

    #[derive(Default)]
    pub struct RecordingObserver {
        seen: Mutex<Vec<usize>>,
    }

    impl RecordingObserver {
        pub fn iterations(&self) -> Vec<usize> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl OptObserver for RecordingObserver {
        fn on_step(&self, _values: &Values, iteration: usize) {
            self.seen.lock().unwrap().push(iteration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OptimizerConfig::default();
        assert_eq!(config.optimizer_type, OptimizerType::LevenbergMarquardt);
        assert_eq!(config.linear_solver_type, LinearSolverType::SparseCholesky);
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.relative_error_tol, 1e-5);
        assert_eq!(config.initial_lambda, 1e-5);
        assert_eq!(config.max_lambda_retries, 10);
        assert!(config.diagonal_damping);
        assert!(config.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let bad_factor = OptimizerConfig::new().with_lambda_schedule(0.5, 1e-12, 1e10);
        assert!(bad_factor.validate().is_err());
        // damping settings only matter for Levenberg-Marquardt
        assert!(
            bad_factor
                .with_optimizer_type(OptimizerType::GaussNewton)
                .validate()
                .is_ok()
        );

        let bad_tol = OptimizerConfig::new().with_relative_error_tol(-1.0);
        assert!(matches!(
            bad_tol.validate(),
            Err(PoseGraphError::InvalidInput(_))
        ));
        let bad_bounds = OptimizerConfig::new().with_lambda_schedule(10.0, 1.0, 1e-3);
        assert!(bad_bounds.validate().is_err());
        assert!(OptimizerConfig::new().with_max_iterations(0).validate().is_err());
    }

    #[test]
    fn test_convergence_order() {
        let config = OptimizerConfig::default();
        assert_eq!(
            check_convergence(&config, 1.0, 1e-13, 1.0),
            Some(ConvergenceCriterion::AbsoluteError)
        );
        assert_eq!(
            check_convergence(&config, 1.0, 1.0 - 1e-7, 1.0),
            Some(ConvergenceCriterion::RelativeErrorDecrease)
        );
        assert_eq!(
            check_convergence(&config, 1.0, 0.5, 1e-12),
            Some(ConvergenceCriterion::StepSize)
        );
        assert_eq!(check_convergence(&config, 1.0, 0.5, 0.1), None);
    }

    #[test]
    fn test_limits() {
        let config = OptimizerConfig::default().with_max_iterations(3);
        let start = Instant::now();
        assert_eq!(check_limits(&config, 2, start), None);
        assert_eq!(
            check_limits(&config, 3, start),
            Some(OptimizationStatus::MaxIterationsReached)
        );

        let expired = OptimizerConfig::default().with_timeout(Duration::ZERO);
        assert_eq!(
            check_limits(&expired, 1, start),
            Some(OptimizationStatus::Timeout)
        );
    }

    #[test]
    fn test_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let config = OptimizerConfig::default().with_cancel_flag(flag.clone());
        assert!(!config.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(config.is_cancelled());
    }

    #[test]
    fn test_ensure_converged() {
        let diagnostics = Diagnostics {
            optimizer_type: OptimizerType::GaussNewton,
            iterations: 5,
            initial_error: 10.0,
            final_error: 1.0,
            status: OptimizationStatus::MaxIterationsReached,
            elapsed: Duration::from_millis(3),
            error_history: vec![10.0, 1.0],
            final_lambda: None,
            rejected_steps: 0,
        };
        assert_eq!(
            diagnostics.termination_reason(),
            OptimizationStatus::MaxIterationsReached
        );
        assert!(diagnostics.to_string().contains("Gauss-Newton"));
        assert!(matches!(
            diagnostics.clone().ensure_converged(),
            Err(PoseGraphError::OptimizationFailed {
                reason: FailureReason::MaxIterationsReached,
                iterations: 5
            })
        ));

        let converged = Diagnostics {
            status: OptimizationStatus::Converged(ConvergenceCriterion::StepSize),
            ..diagnostics
        };
        assert!(converged.ensure_converged().is_ok());
    }

    #[test]
    fn test_time_per_iteration() {
        let mut diagnostics = Diagnostics {
            optimizer_type: OptimizerType::LevenbergMarquardt,
            iterations: 0,
            initial_error: 1.0,
            final_error: 1.0,
            status: OptimizationStatus::Converged(ConvergenceCriterion::AbsoluteError),
            elapsed: Duration::from_millis(6),
            error_history: vec![1.0],
            final_lambda: Some(1e-5),
            rejected_steps: 0,
        };
        let close = |a: Duration, b: Duration| a.abs_diff(b) < Duration::from_nanos(10);
        assert!(close(diagnostics.time_per_iteration(), Duration::from_millis(6)));

        diagnostics.iterations = 4;
        assert!(close(diagnostics.time_per_iteration(), Duration::from_micros(1500)));

        // more iterations than fit in a u32 must not wrap to a small divisor
        diagnostics.iterations = u32::MAX as usize + 2;
        diagnostics.elapsed = Duration::from_secs(1 << 20);
        assert!(diagnostics.time_per_iteration() < Duration::from_millis(1));
        assert!(diagnostics.to_string().contains("Average time per iteration"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            OptimizationStatus::Converged(ConvergenceCriterion::AbsoluteError).to_string(),
            "Converged (absolute error tolerance reached)"
        );
        assert_eq!(OptimizerType::default().to_string(), "Levenberg-Marquardt");
    }
}
