//! Lie-group manifolds for pose-graph optimization.
//!
//! This module provides the rigid-body groups used as optimization variables:
//! - **SE(2)**: rigid transformations in the plane
//! - **SE(3)**: rigid transformations in space
//! - **SO(3)**: rotations in space (the rotational part of SE(3))
//!
//! Group        | Elements       | dim | Tangent      | Compose
//! ------------ | -------------- | --- | ------------ | -------
//! SE(2) motion | [R t; 0 1]     | 3   | [ρ, θ] ∈ R³  | M₁M₂
//! SO(3)        | R, RᵀR = I     | 3   | θ ∈ R³       | R₁R₂
//! SE(3) motion | [R t; 0 1]     | 6   | [ρ, θ] ∈ R⁶  | M₁M₂
//!
//! All Jacobians are *right* Jacobians: they relate a perturbation `X ∘ Exp(δ)` of the input
//! to a perturbation `Y ∘ Exp(ε)` of the output. Optimization updates use the same convention:
//!
//! ```text
//! retract(X, δ) = X ∘ Exp(δ)         (right plus)
//! local(X, Y)   = Log(X⁻¹ ∘ Y)       (right minus, Y ⊖ X)
//! ```
//!
//! Tangent vectors put the translational part first, matching the ordering of the g2o
//! information matrices.

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, Vector3};
use std::fmt::{self, Debug};
use thiserror::Error;

pub mod se2;
pub mod se3;
pub mod so3;

pub use se2::{SE2, SE2Tangent};
pub use se3::{SE3, SE3Tangent};
pub use so3::{SO3, SO3Tangent};

/// Angles below this threshold use series expansions instead of closed forms.
pub(crate) const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Errors raised by manifold operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// A tangent vector did not have the number of components the group expects
    #[error("invalid tangent dimension: expected {expected}, got {actual}")]
    InvalidTangentDimension { expected: usize, actual: usize },

    /// Two elements of different manifolds were combined
    #[error("manifold type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ManifoldType,
        found: ManifoldType,
    },

    /// The element is not a valid member of its group (e.g. a zero quaternion)
    #[error("invalid manifold element: {0}")]
    InvalidElement(String),
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Manifold kinds that can be stored as optimization variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifoldType {
    SE2,
    SE3,
}

impl ManifoldType {
    /// Tangent-space dimension of the manifold.
    pub fn dof(&self) -> usize {
        match self {
            ManifoldType::SE2 => 3,
            ManifoldType::SE3 => 6,
        }
    }
}

impl fmt::Display for ManifoldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldType::SE2 => write!(f, "SE2"),
            ManifoldType::SE3 => write!(f, "SE3"),
        }
    }
}

/// Square Jacobian blocks produced by group operations.
///
/// Implemented for every statically sized square `f64` matrix, so generic factor code can
/// chain Jacobians and hand the result to the sparse assembly as a dynamic matrix.
pub trait JacobianBlock:
    Copy + Debug + std::ops::Mul<Output = Self> + std::ops::Neg<Output = Self>
{
    fn identity_block() -> Self;
    fn to_dmatrix(&self) -> DMatrix<f64>;
}

impl<const N: usize> JacobianBlock for SMatrix<f64, N, N> {
    fn identity_block() -> Self {
        Self::identity()
    }

    fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_iterator(N, N, self.iter().copied())
    }
}

/// Core trait for Lie group operations.
///
/// The design follows the [manif](https://github.com/artivis/manif) C++ library: every
/// operation optionally writes its right Jacobians into caller-provided matrices.
///
/// - `DOF`: tangent space dimension (3 for SE(2), 6 for SE(3))
/// - `REP_SIZE`: number of scalars in the stored representation
pub trait LieGroup: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Tangent space vector type
    type TangentVector: Tangent<Self>;

    /// Square Jacobian type, `DOF x DOF`
    type JacobianMatrix: JacobianBlock;

    const DOF: usize;
    const REP_SIZE: usize;

    /// Identity element.
    fn identity() -> Self;

    /// Group inverse. Jacobian: `J_X⁻¹_X = -Ad(X)`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self;

    /// Composition `self ∘ other`.
    ///
    /// Jacobians: `J_XY_X = Ad(Y⁻¹)`, `J_XY_Y = I`.
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self;

    /// Logarithmic map. Jacobian: `Jr⁻¹(Log(X))`.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector;

    /// Adjoint matrix `Ad(X)`.
    fn adjoint(&self) -> Self::JacobianMatrix;

    /// Random element, used by tests.
    fn random() -> Self;

    /// Re-normalize the rotational part.
    fn normalize(&mut self);

    /// Check that the rotational part is a proper rotation within `tolerance`.
    fn is_valid(&self, tolerance: f64) -> bool;

    /// Component-wise comparison through the tangent space.
    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.right_minus(other).norm() < tolerance
    }

    /// Right plus: `X ⊕ τ = X ∘ Exp(τ)`, with the result re-normalized.
    fn right_plus(&self, tangent: &Self::TangentVector) -> Self {
        let mut result = self.compose(&tangent.exp(None), None, None);
        result.normalize();
        result
    }

    /// Right minus: `X ⊖ Y = Log(Y⁻¹ ∘ X)`.
    fn right_minus(&self, other: &Self) -> Self::TangentVector {
        other.inverse(None).compose(self, None, None).log(None)
    }

    /// Relative transformation `self⁻¹ ∘ other`.
    fn between(&self, other: &Self) -> Self {
        self.inverse(None).compose(other, None, None)
    }
}

/// Trait for Lie algebra (tangent space) elements.
pub trait Tangent<Group: LieGroup>: Clone + Debug + PartialEq + Send + Sync {
    /// Exponential map. Jacobian: `Jr(τ)`.
    fn exp(&self, jacobian: Option<&mut Group::JacobianMatrix>) -> Group;

    /// Right Jacobian `Jr(τ)`.
    fn right_jacobian(&self) -> Group::JacobianMatrix;

    /// Inverse of the right Jacobian `Jr⁻¹(τ)`.
    fn right_jacobian_inv(&self) -> Group::JacobianMatrix;

    /// Zero tangent vector.
    fn zero() -> Self;

    /// Small random tangent vector, used by tests.
    fn random() -> Self;

    /// Euclidean norm of the coefficients.
    fn norm(&self) -> f64;

    /// Coefficients as a dynamic vector.
    fn to_dvector(&self) -> DVector<f64>;

    /// Build from coefficients; fails when the length differs from `Group::DOF`.
    fn from_slice(coefficients: &[f64]) -> ManifoldResult<Self>;

    fn is_zero(&self, tolerance: f64) -> bool {
        self.norm() < tolerance
    }
}

/// Skew-symmetric matrix `[v]ₓ`.
pub(crate) fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

pub(crate) fn check_tangent_len(expected: usize, actual: usize) -> ManifoldResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ManifoldError::InvalidTangentDimension { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn test_manifold_type_dof() {
        assert_eq!(ManifoldType::SE2.dof(), 3);
        assert_eq!(ManifoldType::SE3.dof(), 6);
        assert_eq!(ManifoldType::SE3.to_string(), "SE3");
    }

    #[test]
    fn test_jacobian_block_to_dmatrix_is_column_major() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        let d = m.to_dmatrix();
        assert_eq!(d.nrows(), 3);
        assert_eq!(d[(0, 1)], 2.0);
        assert_eq!(d[(2, 0)], 7.0);
    }

    #[test]
    fn test_skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.4, 1.1);
        assert!((skew(&a) * b - a.cross(&b)).norm() < 1e-14);
    }

    #[test]
    fn test_check_tangent_len() {
        assert!(check_tangent_len(3, 3).is_ok());
        assert_eq!(
            check_tangent_len(3, 6),
            Err(ManifoldError::InvalidTangentDimension {
                expected: 3,
                actual: 6
            })
        );
    }
}
