//! Optimization variables.
//!
//! [`Variable`] is the closed set of manifold values a [`Values`](super::values::Values) store can
//! hold. [`VariableType`] ties each Lie group to its variant so factors can be generic over the
//! group and still read typed values out of the store.

use crate::manifold::{
    LieGroup, ManifoldError, ManifoldResult, ManifoldType, Tangent, se2::SE2, se2::SE2Tangent,
    se3::SE3, se3::SE3Tangent,
};
use nalgebra::DVector;
use std::fmt;

/// A manifold-valued optimization variable
#[derive(Clone, Debug, PartialEq)]
pub enum Variable {
    /// SE(2) pose, 3 tangent dimensions
    SE2(SE2),
    /// SE(3) pose, 6 tangent dimensions
    SE3(SE3),
}

impl Variable {
    pub fn manifold_type(&self) -> ManifoldType {
        match self {
            Variable::SE2(_) => ManifoldType::SE2,
            Variable::SE3(_) => ManifoldType::SE3,
        }
    }

    /// Tangent-space dimension
    pub fn dof(&self) -> usize {
        self.manifold_type().dof()
    }

    /// Right-plus retraction `self ∘ Exp(delta)`, rotation renormalized.
    pub fn retract(&self, delta: &[f64]) -> ManifoldResult<Variable> {
        match self {
            Variable::SE2(pose) => {
                let tangent = SE2Tangent::from_slice(delta)?;
                Ok(Variable::SE2(pose.right_plus(&tangent)))
            }
            Variable::SE3(pose) => {
                let tangent = SE3Tangent::from_slice(delta)?;
                Ok(Variable::SE3(pose.right_plus(&tangent)))
            }
        }
    }

    /// Tangent difference `Log(self⁻¹ ∘ other)`, so `self.retract(self.local(other)) == other`.
    pub fn local(&self, other: &Variable) -> ManifoldResult<DVector<f64>> {
        match (self, other) {
            (Variable::SE2(a), Variable::SE2(b)) => Ok(b.right_minus(a).to_dvector()),
            (Variable::SE3(a), Variable::SE3(b)) => Ok(b.right_minus(a).to_dvector()),
            _ => Err(ManifoldError::TypeMismatch {
                expected: self.manifold_type(),
                found: other.manifold_type(),
            }),
        }
    }

    pub fn as_se2(&self) -> Option<&SE2> {
        match self {
            Variable::SE2(pose) => Some(pose),
            _ => None,
        }
    }

    pub fn as_se3(&self) -> Option<&SE3> {
        match self {
            Variable::SE3(pose) => Some(pose),
            _ => None,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::SE2(pose) => write!(f, "{pose}"),
            Variable::SE3(pose) => write!(f, "{pose}"),
        }
    }
}

impl From<SE2> for Variable {
    fn from(pose: SE2) -> Self {
        Variable::SE2(pose)
    }
}

impl From<SE3> for Variable {
    fn from(pose: SE3) -> Self {
        Variable::SE3(pose)
    }
}

/// Lie groups that can be stored as a [`Variable`].
pub trait VariableType: LieGroup {
    const MANIFOLD_TYPE: ManifoldType;

    /// Borrow the group element if the variable holds this type.
    fn from_variable(variable: &Variable) -> Option<&Self>;

    fn into_variable(self) -> Variable;
}

impl VariableType for SE2 {
    const MANIFOLD_TYPE: ManifoldType = ManifoldType::SE2;

    fn from_variable(variable: &Variable) -> Option<&Self> {
        variable.as_se2()
    }

    fn into_variable(self) -> Variable {
        Variable::SE2(self)
    }
}

impl VariableType for SE3 {
    const MANIFOLD_TYPE: ManifoldType = ManifoldType::SE3;

    fn from_variable(variable: &Variable) -> Option<&Self> {
        variable.as_se3()
    }

    fn into_variable(self) -> Variable {
        Variable::SE3(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_dof_per_manifold() {
        assert_eq!(Variable::SE2(SE2::identity()).dof(), 3);
        assert_eq!(Variable::SE3(SE3::identity()).dof(), 6);
    }

    #[test]
    fn test_retract_se2_small_step() {
        let variable = Variable::SE2(SE2::from_xy_angle(1.0, 0.0, 0.0));
        let moved = variable.retract(&[0.1, 0.0, 0.0]).unwrap();
        let pose = moved.as_se2().unwrap();
        assert_relative_eq!(pose.x(), 1.1, epsilon = 1e-12);
        assert_relative_eq!(pose.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_retract_rejects_wrong_length() {
        let variable = Variable::SE3(SE3::identity());
        assert!(matches!(
            variable.retract(&[0.0; 3]),
            Err(ManifoldError::InvalidTangentDimension {
                expected: 6,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_local_inverts_retract() {
        let variable = Variable::SE3(SE3::from_translation_euler(
            Vector3::new(1.0, -2.0, 0.5),
            0.1,
            0.2,
            -0.3,
        ));
        let delta = [0.05, -0.02, 0.01, 0.03, -0.04, 0.02];
        let moved = variable.retract(&delta).unwrap();
        let recovered = variable.local(&moved).unwrap();
        assert_relative_eq!(
            recovered,
            DVector::from_column_slice(&delta),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_local_type_mismatch() {
        let a = Variable::SE2(SE2::identity());
        let b = Variable::SE3(SE3::identity());
        assert!(matches!(
            a.local(&b),
            Err(ManifoldError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_variable_type_lookup() {
        let variable = SE2::from_xy_angle(0.0, 1.0, 0.5).into_variable();
        assert!(SE2::from_variable(&variable).is_some());
        assert!(SE3::from_variable(&variable).is_none());
    }
}
