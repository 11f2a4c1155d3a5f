//! # posegraph
//!
//! Nonlinear least-squares optimization of pose graphs on SE(2) and SE(3).
//!
//! ## Features
//!
//! - **Factor graphs**: prior and between factors with Gaussian noise models and optional robust
//!   kernels, linearized in parallel into a sparse Jacobian
//! - **Optimizers**: Gauss-Newton and Levenberg-Marquardt with deterministic results
//! - **Linear Algebra Backends**: sparse Cholesky and sparse QR built on faer
//! - **g2o I/O**: `VERTEX_SE2`, `EDGE_SE2`, `VERTEX_SE3:QUAT` and `EDGE_SE3:QUAT` records
//!
//! ## Example
//!
//! ```
//! use posegraph::{
//!     BetweenFactor, FactorGraph, GaussianNoise, Key, LieGroup, OptimizerConfig, PriorFactor, SE2,
//!     Values,
//! };
//!
//! let mut graph = FactorGraph::new();
//! graph.add(PriorFactor::new(Key(0), SE2::identity(), GaussianNoise::identity(3)).unwrap());
//! let odometry = SE2::from_xy_angle(1.0, 0.0, 0.0);
//! graph.add(BetweenFactor::new(Key(0), Key(1), odometry, GaussianNoise::identity(3)).unwrap());
//!
//! let mut values = Values::new();
//! values.insert(Key(0), SE2::from_xy_angle(0.1, -0.1, 0.05)).unwrap();
//! values.insert(Key(1), SE2::from_xy_angle(1.2, 0.1, -0.1)).unwrap();
//!
//! let config = OptimizerConfig::default();
//! let (result, diagnostics) = posegraph::optimize(&graph, values, &config).unwrap();
//! assert!(diagnostics.status.is_converged());
//! assert!((result.get::<SE2>(Key(1)).unwrap().x() - 1.0).abs() < 1e-6);
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod io;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;

// Re-export core types
pub use crate::core::graph::{FactorGraph, LinearSystem};
pub use crate::core::key::Key;
pub use crate::core::noise::GaussianNoise;
pub use crate::core::values::{Delta, Values};
pub use crate::core::variable::{Variable, VariableType};
pub use error::{FailureReason, PoseGraphError, PoseGraphResult};

pub use factors::{BetweenFactor, Factor, PriorFactor};
pub use io::{G2oGraph, G2oLoader, LoaderOptions};
pub use linalg::{LinearSolverType, SparseCholeskySolver, SparseLinearSolver, SparseQRSolver};
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{LieGroup, ManifoldType, SE2, SE3, SO3, Tangent};
pub use optimizer::{
    Diagnostics, GaussNewton, LevenbergMarquardt, OptObserver, OptObserverVec,
    OptimizationStatus, OptimizerConfig, OptimizerType, Solver, optimize,
};
