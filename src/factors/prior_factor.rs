use super::{Factor, FactorEvaluation, check_noise_dimension};
use crate::core::key::Key;
use crate::core::loss_functions::Loss;
use crate::core::noise::GaussianNoise;
use crate::core::values::Values;
use crate::core::variable::VariableType;
use crate::error::PoseGraphResult;
use crate::manifold::{JacobianBlock, LieGroup, Tangent};
use std::any::Any;
use std::sync::Arc;

/// Unary factor pulling one variable towards a measured value.
///
/// ```text
/// r = Log(z⁻¹ ∘ x),    ∂r/∂x = Jr⁻¹(r)
/// ```
///
/// A prior removes the gauge freedom of a pose graph; without one per connected component the
/// normal equations are singular.
///
/// # Example
///
/// ```
/// use posegraph::core::{key::Key, noise::GaussianNoise, values::Values};
/// use posegraph::factors::{Factor, PriorFactor};
/// use posegraph::manifold::SE2;
///
/// let prior = SE2::from_xy_angle(1.0, 2.0, 0.3);
/// let factor = PriorFactor::new(Key(0), prior.clone(), GaussianNoise::identity(3)).unwrap();
///
/// let mut values = Values::new();
/// values.insert(Key(0), prior).unwrap();
/// assert!(factor.error(&values).unwrap() < 1e-20);
/// ```
#[derive(Debug, Clone)]
pub struct PriorFactor<T: VariableType> {
    keys: [Key; 1],
    prior: T,
    prior_inverse: T,
    noise: GaussianNoise,
    loss: Option<Arc<dyn Loss>>,
}

impl<T: VariableType> PriorFactor<T> {
    /// # Errors
    /// `InvalidInput` if the noise dimension differs from the manifold DOF.
    pub fn new(key: Key, prior: T, noise: GaussianNoise) -> PoseGraphResult<Self> {
        check_noise_dimension(&noise, T::DOF)?;
        Ok(PriorFactor {
            keys: [key],
            prior_inverse: prior.inverse(None),
            prior,
            noise,
            loss: None,
        })
    }

    pub fn with_loss(mut self, loss: impl Loss + 'static) -> Self {
        self.loss = Some(Arc::new(loss));
        self
    }

    pub fn key(&self) -> Key {
        self.keys[0]
    }

    pub fn prior(&self) -> &T {
        &self.prior
    }
}

impl<T: VariableType> Factor for PriorFactor<T> {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dimension(&self) -> usize {
        T::DOF
    }

    fn noise_model(&self) -> &GaussianNoise {
        &self.noise
    }

    fn loss_function(&self) -> Option<&dyn Loss> {
        self.loss.as_deref()
    }

    fn evaluate(
        &self,
        values: &Values,
        compute_jacobians: bool,
    ) -> PoseGraphResult<FactorEvaluation> {
        let x = values.get::<T>(self.keys[0])?;
        let diff = self.prior_inverse.compose(x, None, None);

        if !compute_jacobians {
            return Ok(FactorEvaluation {
                residual: diff.log(None).to_dvector(),
                jacobians: Vec::new(),
            });
        }

        let mut j_log = T::JacobianMatrix::identity_block();
        let residual = diff.log(Some(&mut j_log));
        Ok(FactorEvaluation {
            residual: residual.to_dvector(),
            jacobians: vec![j_log.to_dmatrix()],
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::HuberLoss;
    use crate::error::PoseGraphError;
    use crate::factors::test_utils::check_jacobians;
    use crate::manifold::{SE2, SE3};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_prior_zero_at_measurement() {
        let prior = SE3::from_translation_euler(Vector3::new(1.0, 2.0, 3.0), 0.1, -0.2, 0.3);
        let factor = PriorFactor::new(Key(4), prior.clone(), GaussianNoise::identity(6)).unwrap();
        let mut values = Values::new();
        values.insert(Key(4), prior).unwrap();

        let residual = factor.evaluate(&values, false).unwrap().residual;
        assert_relative_eq!(residual.norm(), 0.0, epsilon = 1e-12);
        assert_eq!(factor.keys(), &[Key(4)]);
        assert_eq!(factor.dimension(), 6);
    }

    #[test]
    fn test_prior_error_is_half_whitened_norm() {
        let factor = PriorFactor::new(
            Key(0),
            SE2::identity(),
            GaussianNoise::from_scalar_sigma(3, 0.5).unwrap(),
        )
        .unwrap();
        let mut values = Values::new();
        values.insert(Key(0), SE2::from_xy_angle(1.0, 0.0, 0.0)).unwrap();
        // residual [1, 0, 0], whitened [2, 0, 0]
        assert_relative_eq!(factor.error(&values).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_prior_jacobians_numerical() {
        let factor = PriorFactor::new(
            Key(0),
            SE2::from_xy_angle(0.5, -1.0, 0.8),
            GaussianNoise::identity(3),
        )
        .unwrap();
        let mut values = Values::new();
        values.insert(Key(0), SE2::from_xy_angle(1.2, 0.3, -0.4)).unwrap();
        check_jacobians(&factor, &values);

        let factor = PriorFactor::new(
            Key(1),
            SE3::from_translation_euler(Vector3::new(0.2, 0.1, -0.3), 0.3, 0.1, -0.2),
            GaussianNoise::identity(6),
        )
        .unwrap();
        let mut values = Values::new();
        values
            .insert(
                Key(1),
                SE3::from_translation_euler(Vector3::new(1.0, -0.5, 0.4), -0.2, 0.4, 0.6),
            )
            .unwrap();
        check_jacobians(&factor, &values);
    }

    #[test]
    fn test_prior_noise_dimension_checked() {
        let result = PriorFactor::new(Key(0), SE3::identity(), GaussianNoise::identity(3));
        assert!(matches!(result, Err(PoseGraphError::InvalidInput(_))));
    }

    #[test]
    fn test_prior_wrong_manifold() {
        let factor = PriorFactor::new(Key(0), SE2::identity(), GaussianNoise::identity(3)).unwrap();
        let mut values = Values::new();
        values.insert(Key(0), SE3::identity()).unwrap();
        assert!(matches!(
            factor.error(&values),
            Err(PoseGraphError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_prior_with_huber_caps_error() {
        let factor = PriorFactor::new(Key(0), SE2::identity(), GaussianNoise::identity(3))
            .unwrap()
            .with_loss(HuberLoss::new(1.0).unwrap());
        let mut values = Values::new();
        values.insert(Key(0), SE2::from_xy_angle(10.0, 0.0, 0.0)).unwrap();
        // s = 100, ρ = 2·1·10 - 1 = 19
        assert_relative_eq!(factor.error(&values).unwrap(), 9.5, epsilon = 1e-9);

        let linearized = factor.linearize(&values).unwrap();
        assert_relative_eq!(linearized.error, 9.5, epsilon = 1e-9);
        assert!(linearized.residual.norm() < 10.0);
    }
}
