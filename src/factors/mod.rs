//! Factors for pose-graph optimization
//!
//! A factor is an immutable measurement over one or more variables. Implementations provide the
//! raw residual and its Jacobian blocks (one per key, with respect to the right-plus retraction of
//! that key); the provided methods of [`Factor`] handle whitening by the noise model and robust
//! correction, so every factor type gets the same error and linearization semantics.
//!
//! - [`PriorFactor`]: anchors one variable to a measured value, `r = Log(z⁻¹ ∘ x)`
//! - [`BetweenFactor`]: relative pose between two variables, `r = Log(z⁻¹ ∘ xᵢ⁻¹ ∘ xⱼ)`

use crate::core::corrector::Corrector;
use crate::core::key::Key;
use crate::core::loss_functions::Loss;
use crate::core::noise::GaussianNoise;
use crate::core::values::Values;
use crate::error::{PoseGraphError, PoseGraphResult};
use nalgebra::{DMatrix, DVector};
use std::any::Any;
use std::fmt;

pub mod between_factor;
pub mod prior_factor;

pub use between_factor::BetweenFactor;
pub use prior_factor::PriorFactor;

/// Raw (unwhitened) residual and per-key Jacobian blocks.
///
/// `jacobians` is empty when Jacobians were not requested, otherwise it holds one
/// `dimension × dof(key)` block per entry of [`Factor::keys`], in the same order.
#[derive(Debug, Clone)]
pub struct FactorEvaluation {
    pub residual: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
}

/// Whitened, robust-corrected linearization of a single factor.
#[derive(Debug, Clone)]
pub struct LinearizedFactor {
    pub keys: Vec<Key>,
    pub residual: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
    /// Factor error at the linearization point
    pub error: f64,
}

pub trait Factor: fmt::Debug + Send + Sync + 'static {
    /// Keys of the connected variables, in Jacobian block order
    fn keys(&self) -> &[Key];

    /// Residual dimension
    fn dimension(&self) -> usize;

    fn noise_model(&self) -> &GaussianNoise;

    fn loss_function(&self) -> Option<&dyn Loss> {
        None
    }

    /// Raw residual and, if `compute_jacobians`, the Jacobian block of every key.
    ///
    /// # Errors
    /// `KeyNotFound` for an absent key, `DimensionMismatch` for a value of the wrong manifold.
    fn evaluate(&self, values: &Values, compute_jacobians: bool)
    -> PoseGraphResult<FactorEvaluation>;

    fn as_any(&self) -> &dyn Any;

    fn whitened_residual(&self, values: &Values) -> PoseGraphResult<DVector<f64>> {
        let evaluation = self.evaluate(values, false)?;
        Ok(self.noise_model().whiten(&evaluation.residual))
    }

    /// `½‖R r‖²`, or `½ρ(‖R r‖²)` with a robust loss.
    fn error(&self, values: &Values) -> PoseGraphResult<f64> {
        let sq_norm = self.whitened_residual(values)?.norm_squared();
        Ok(robust_error(self.loss_function(), sq_norm))
    }

    fn linearize(&self, values: &Values) -> PoseGraphResult<LinearizedFactor> {
        let evaluation = self.evaluate(values, true)?;
        if evaluation.jacobians.len() != self.keys().len() {
            return Err(PoseGraphError::InvalidInput(format!(
                "factor produced {} Jacobian blocks for {} keys",
                evaluation.jacobians.len(),
                self.keys().len()
            )));
        }

        let noise = self.noise_model();
        let mut residual = noise.whiten(&evaluation.residual);
        let mut jacobians: Vec<DMatrix<f64>> = evaluation
            .jacobians
            .iter()
            .map(|block| noise.whiten_jacobian(block))
            .collect();

        let sq_norm = residual.norm_squared();
        let error = match self.loss_function() {
            Some(loss) => {
                let rho = loss.evaluate(sq_norm);
                let corrector = Corrector::new(sq_norm, rho);
                for block in jacobians.iter_mut() {
                    corrector.correct_jacobian(&residual, block);
                }
                corrector.correct_residual(&mut residual);
                0.5 * rho[0]
            }
            None => 0.5 * sq_norm,
        };

        Ok(LinearizedFactor {
            keys: self.keys().to_vec(),
            residual,
            jacobians,
            error,
        })
    }
}

fn robust_error(loss: Option<&dyn Loss>, sq_norm: f64) -> f64 {
    match loss {
        Some(loss) => 0.5 * loss.evaluate(sq_norm)[0],
        None => 0.5 * sq_norm,
    }
}

pub(crate) fn check_noise_dimension(noise: &GaussianNoise, dof: usize) -> PoseGraphResult<()> {
    if noise.dim() != dof {
        return Err(PoseGraphError::InvalidInput(format!(
            "noise model has dimension {}, factor residual has dimension {dof}",
            noise.dim()
        )));
    }
    Ok(())
}
