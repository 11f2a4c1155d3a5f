use super::{Factor, FactorEvaluation, check_noise_dimension};
use crate::core::key::Key;
use crate::core::loss_functions::Loss;
use crate::core::noise::GaussianNoise;
use crate::core::values::Values;
use crate::core::variable::VariableType;
use crate::error::{PoseGraphError, PoseGraphResult};
use crate::manifold::{JacobianBlock, LieGroup, Tangent};
use std::any::Any;
use std::sync::Arc;

/// Generic between factor for Lie group pose constraints.
///
/// Represents a relative pose measurement `z` (odometry or loop closure) between poses
/// `xᵢ` and `xⱼ`:
///
/// ```text
/// r = Log(z⁻¹ ∘ xᵢ⁻¹ ∘ xⱼ)
/// ```
///
/// # Jacobian Computation
///
/// The Jacobians are obtained by chaining the right Jacobians of each group operation:
///
/// ```text
/// ∂r/∂xᵢ = Jr⁻¹(r) · Ad(xⱼ⁻¹) · I · (-Ad(xᵢ)) = -Jr⁻¹(r) · Ad(xⱼ⁻¹ ∘ xᵢ)
/// ∂r/∂xⱼ = Jr⁻¹(r)
/// ```
///
/// # Example
///
/// ```
/// use posegraph::core::{key::Key, noise::GaussianNoise, values::Values};
/// use posegraph::factors::{BetweenFactor, Factor};
/// use posegraph::manifold::SE2;
///
/// let odometry = SE2::from_xy_angle(1.0, 0.0, 0.0);
/// let factor = BetweenFactor::new(Key(0), Key(1), odometry, GaussianNoise::identity(3)).unwrap();
///
/// let mut values = Values::new();
/// values.insert(Key(0), SE2::from_xy_angle(0.0, 0.0, 0.0)).unwrap();
/// values.insert(Key(1), SE2::from_xy_angle(1.0, 0.0, 0.0)).unwrap();
/// assert!(factor.error(&values).unwrap() < 1e-20);
/// ```
#[derive(Debug, Clone)]
pub struct BetweenFactor<T: VariableType> {
    keys: [Key; 2],
    measured: T,
    measured_inverse: T,
    noise: GaussianNoise,
    loss: Option<Arc<dyn Loss>>,
}

impl<T: VariableType> BetweenFactor<T> {
    /// # Errors
    /// `InvalidInput` if the noise dimension differs from the manifold DOF or both keys are equal.
    pub fn new(key_i: Key, key_j: Key, measured: T, noise: GaussianNoise) -> PoseGraphResult<Self> {
        check_noise_dimension(&noise, T::DOF)?;
        if key_i == key_j {
            return Err(PoseGraphError::InvalidInput(format!(
                "between factor connects {key_i} to itself"
            )));
        }
        Ok(BetweenFactor {
            keys: [key_i, key_j],
            measured_inverse: measured.inverse(None),
            measured,
            noise,
            loss: None,
        })
    }

    pub fn with_loss(mut self, loss: impl Loss + 'static) -> Self {
        self.loss = Some(Arc::new(loss));
        self
    }

    pub fn key_i(&self) -> Key {
        self.keys[0]
    }

    pub fn key_j(&self) -> Key {
        self.keys[1]
    }

    /// Measured relative pose `xᵢ⁻¹ ∘ xⱼ`
    pub fn measured(&self) -> &T {
        &self.measured
    }
}

impl<T: VariableType> Factor for BetweenFactor<T> {
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
        let pose_i = values.get::<T>(self.keys[0])?;
        let pose_j = values.get::<T>(self.keys[1])?;

        if !compute_jacobians {
            let diff = self
                .measured_inverse
                .compose(&pose_i.inverse(None), None, None)
                .compose(pose_j, None, None);
            return Ok(FactorEvaluation {
                residual: diff.log(None).to_dvector(),
                jacobians: Vec::new(),
            });
        }

        // Step 1: xᵢ⁻¹
        let mut j_inv_wrt_i = T::JacobianMatrix::identity_block();
        let inv_i = pose_i.inverse(Some(&mut j_inv_wrt_i));

        // Step 2: z⁻¹ ∘ xᵢ⁻¹
        let mut j_zi_wrt_inv = T::JacobianMatrix::identity_block();
        let z_inv_i = self
            .measured_inverse
            .compose(&inv_i, None, Some(&mut j_zi_wrt_inv));

        // Step 3: (z⁻¹ ∘ xᵢ⁻¹) ∘ xⱼ
        let mut j_diff_wrt_zi = T::JacobianMatrix::identity_block();
        let mut j_diff_wrt_j = T::JacobianMatrix::identity_block();
        let diff = z_inv_i.compose(pose_j, Some(&mut j_diff_wrt_zi), Some(&mut j_diff_wrt_j));

        // Step 4: Log
        let mut j_log = T::JacobianMatrix::identity_block();
        let residual = diff.log(Some(&mut j_log));

        let jacobian_i = j_log * j_diff_wrt_zi * j_zi_wrt_inv * j_inv_wrt_i;
        let jacobian_j = j_log * j_diff_wrt_j;

        Ok(FactorEvaluation {
            residual: residual.to_dvector(),
            jacobians: vec![jacobian_i.to_dmatrix(), jacobian_j.to_dmatrix()],
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
