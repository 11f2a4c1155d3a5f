//! Robust residual and Jacobian correction.
//!
//! Given a whitened residual `r` with `s = ‖r‖²` and a loss `[ρ, ρ', ρ'']`, the corrector rescales
//! `r` and `J` so that the Gauss-Newton model of the corrected problem matches the second-order
//! model of `½ ρ(s)`:
//!
//! ```text
//! r̃ = √ρ' / (1 - α) · r
//! J̃ = √ρ' · (I - α rrᵀ / s) · J,    with  ½α² - α - s ρ''/ρ' = 0
//! ```
//!
//! When `ρ'' ≤ 0` (Huber, Cauchy, Geman-McClure) or `s = 0`, α is taken as zero and the
//! correction reduces to scaling by `√ρ'`.

use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone, Copy)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Build the correction for a residual with squared norm `sq_norm` and loss evaluation
    /// `rho = [ρ, ρ', ρ'']` at that norm.
    ///
    /// Without curvature (`ρ'' <= 0`, or a zero residual) the correction reduces to scaling
    /// residual and Jacobian by `√ρ'`.
    pub fn new(sq_norm: f64, rho: [f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].max(0.0).sqrt();

        if sq_norm == 0.0 || rho[2] <= 0.0 {
            return Corrector {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * sq_norm * rho[2] / rho[1];
        let alpha = 1.0 - d.sqrt();
        Corrector {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Must be called with the uncorrected residual.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let r_t_j = residual.transpose() * &*jacobian;
        let correction = residual * r_t_j * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }

    pub fn correct_residual(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{HuberLoss, L2Loss, Loss};
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_is_identity() {
        let residual = DVector::from_vec(vec![1.0, -2.0]);
        let mut jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 2.0]);
        let expected = jacobian.clone();
        let corrector = Corrector::new(residual.norm_squared(), L2Loss.evaluate(5.0));

        let mut corrected = residual.clone();
        corrector.correct_jacobian(&residual, &mut jacobian);
        corrector.correct_residual(&mut corrected);
        assert_relative_eq!(jacobian, expected);
        assert_relative_eq!(corrected, residual);
    }

    #[test]
    fn test_huber_outlier_is_downweighted() {
        let huber = HuberLoss::new(1.0).unwrap();
        let residual = DVector::from_vec(vec![3.0, 4.0]);
        let s = residual.norm_squared();
        let rho = huber.evaluate(s);
        let corrector = Corrector::new(s, rho);

        let mut corrected = residual.clone();
        corrector.correct_residual(&mut corrected);
        // ‖r̃‖² = ρ'(s) s
        assert_relative_eq!(corrected.norm_squared(), rho[1] * s, epsilon = 1e-12);
        assert!(corrected.norm() < residual.norm());
    }

    #[test]
    fn test_positive_curvature_branch() {
        // ρ(s) = s + s², ρ' = 1 + 2s, ρ'' = 2
        let s = 0.5;
        let residual = DVector::from_vec(vec![0.5, 0.5]);
        let corrector = Corrector::new(s, [s + s * s, 1.0 + 2.0 * s, 2.0]);
        let mut jacobian = DMatrix::identity(2, 2);
        corrector.correct_jacobian(&residual, &mut jacobian);
        // J̃ᵀJ̃ must equal ρ' I + 2ρ'' r rᵀ
        let expected = DMatrix::identity(2, 2) * (1.0 + 2.0 * s)
            + &residual * residual.transpose() * 4.0;
        assert_relative_eq!(jacobian.transpose() * &jacobian, expected, epsilon = 1e-12);
    }
}
