//! Error types for the posegraph library
//!
//! Module-level errors (`ManifoldError`, `LinAlgError`, `IoError`) convert into the crate-wide
//! [`PoseGraphError`]. Structural problems (duplicate or missing keys, manifold mismatches)
//! surface as soon as they are detected; numerical failures surface from the optimizer.

use crate::core::key::Key;
use crate::io::IoError;
use crate::linalg::LinAlgError;
use crate::manifold::ManifoldError;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the library
pub type PoseGraphResult<T> = Result<T, PoseGraphError>;

/// Why an optimization run terminated without a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The iteration ceiling was reached and the caller required convergence
    MaxIterationsReached,
    /// Levenberg-Marquardt raised the damping the maximum number of times without finding a
    /// decreasing step
    LmRetriesExhausted,
    /// The damped system stayed singular through every retry
    SingularSystem,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::MaxIterationsReached => write!(f, "maximum iterations reached"),
            FailureReason::LmRetriesExhausted => write!(f, "damping retries exhausted"),
            FailureReason::SingularSystem => write!(f, "singular linear system"),
        }
    }
}

/// Main error type for the posegraph library
#[derive(Debug, Error)]
pub enum PoseGraphError {
    /// A value was inserted under a key that is already present
    #[error("duplicate key: {0}")]
    DuplicateKey(Key),

    /// A lookup or update referenced a key that is not stored
    #[error("key not found: {0}")]
    KeyNotFound(Key),

    /// The stored value (or supplied tangent vector) has the wrong manifold or size
    #[error("dimension mismatch for key {key}: expected {expected}, found {found}")]
    DimensionMismatch {
        key: Key,
        expected: String,
        found: String,
    },

    /// A factor references a key with no value
    #[error("factor {factor} references missing variable {key}")]
    MissingVariable { key: Key, factor: usize },

    /// The normal equations could not be solved
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// Terminal optimizer failure
    #[error("optimization failed after {iterations} iterations: {reason}")]
    OptimizationFailed {
        reason: FailureReason,
        iterations: usize,
    },

    /// Invalid input parameters (noise models, configuration, factor construction)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Linear algebra failures other than singularity
    #[error("linear algebra error: {0}")]
    LinearAlgebra(String),

    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    #[error(transparent)]
    Io(#[from] IoError),
}

impl From<LinAlgError> for PoseGraphError {
    fn from(err: LinAlgError) -> Self {
        match err {
            LinAlgError::SingularMatrix(msg) => PoseGraphError::SingularSystem(msg),
            other => PoseGraphError::LinearAlgebra(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PoseGraphError::MissingVariable {
            key: Key::symbol('x', 3),
            factor: 7,
        };
        assert_eq!(error.to_string(), "factor 7 references missing variable x3");

        let error = PoseGraphError::OptimizationFailed {
            reason: FailureReason::LmRetriesExhausted,
            iterations: 4,
        };
        assert_eq!(
            error.to_string(),
            "optimization failed after 4 iterations: damping retries exhausted"
        );
    }

    #[test]
    fn test_from_linalg_singular() {
        let error = PoseGraphError::from(LinAlgError::SingularMatrix("pivot 3".to_string()));
        assert!(matches!(error, PoseGraphError::SingularSystem(msg) if msg == "pivot 3"));

        let error =
            PoseGraphError::from(LinAlgError::SparseMatrixCreation("bad triplet".to_string()));
        assert!(matches!(error, PoseGraphError::LinearAlgebra(_)));
    }

    #[test]
    fn test_from_manifold_error() {
        let error = PoseGraphError::from(ManifoldError::InvalidTangentDimension {
            expected: 3,
            actual: 6,
        });
        assert!(error.to_string().contains("expected 3, got 6"));
    }

    #[test]
    fn test_result_alias() {
        let result: PoseGraphResult<i32> = Err(PoseGraphError::KeyNotFound(Key(1)));
        assert!(result.is_err());
    }
}
