//! Robust loss functions for outlier rejection.
//!
//! A loss function ρ(s) replaces the squared whitened residual norm `s = ‖Rr‖²` of a factor.
//! Without a loss, a factor's error is `½ s`; with one, it is `½ ρ(s)`. Every loss here satisfies
//! ρ(0) = 0 and ρ'(0) = 1, so small residuals are weighted exactly as in plain least squares.
//!
//! Each loss returns `[ρ(s), ρ'(s), ρ''(s)]`; the derivatives drive the
//! [`Corrector`](super::corrector::Corrector), which rescales the residual and Jacobian so the
//! linear solver can stay unaware of robust weighting.
//!
//! # Example
//!
//! ```
//! use posegraph::core::loss_functions::{HuberLoss, Loss};
//!
//! let huber = HuberLoss::new(1.345).unwrap();
//! let [rho, rho_prime, _] = huber.evaluate(0.5);
//! assert_eq!(rho, 0.5);
//! assert_eq!(rho_prime, 1.0);
//! ```

use crate::error::{PoseGraphError, PoseGraphResult};
use std::fmt::Debug;

/// Trait for robust loss functions.
///
/// `evaluate(s)` receives the squared whitened residual norm (never negative) and returns the
/// cost and its first two derivatives.
pub trait Loss: Debug + Send + Sync {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(scale: f64) -> PoseGraphResult<f64> {
    if scale > 0.0 && scale.is_finite() {
        Ok(scale)
    } else {
        Err(PoseGraphError::InvalidInput(format!(
            "loss scale must be positive and finite, got {scale}"
        )))
    }
}

/// Plain least squares, ρ(s) = s.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Loss;

impl Loss for L2Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic for inliers, linear beyond the threshold δ.
///
/// ```text
/// ρ(s) = s              if s ≤ δ²
///        2δ√s - δ²      otherwise
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    /// `scale` is the inlier threshold δ on the residual norm; 1.345 gives 95% efficiency on
    /// Gaussian noise.
    pub fn new(scale: f64) -> PoseGraphResult<Self> {
        let scale = check_scale(scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = self.scale / r;
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy (Lorentzian) loss, ρ(s) = δ² ln(1 + s/δ²).
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    c: f64,
}

impl CauchyLoss {
    /// Default scale for 95% efficiency is 2.3849.
    pub fn new(scale: f64) -> PoseGraphResult<Self> {
        let scale = check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.scale2 * (s * self.c).ln_1p(),
            inv,
            -self.c * inv * inv,
        ]
    }
}

/// Geman-McClure loss, ρ(s) = δ² s / (δ² + s). Bounded, so gross outliers stop contributing.
#[derive(Debug, Clone)]
pub struct GemanMcClureLoss {
    scale2: f64,
}

impl GemanMcClureLoss {
    /// Default scale for 95% efficiency is 1.3998.
    pub fn new(scale: f64) -> PoseGraphResult<Self> {
        let scale = check_scale(scale)?;
        Ok(GemanMcClureLoss {
            scale2: scale * scale,
        })
    }
}

impl Loss for GemanMcClureLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let denom = self.scale2 + s;
        let ratio = self.scale2 / denom;
        [
            self.scale2 * s / denom,
            ratio * ratio,
            -2.0 * ratio * ratio / denom,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn check_derivatives(loss: &dyn Loss, s: f64) {
        let h = 1e-6;
        let [rho, rho1, rho2] = loss.evaluate(s);
        let [rho_p, rho1_p, _] = loss.evaluate(s + h);
        let [rho_m, rho1_m, _] = loss.evaluate(s - h);
        assert_relative_eq!(rho1, (rho_p - rho_m) / (2.0 * h), epsilon = 1e-6);
        assert_relative_eq!(rho2, (rho1_p - rho1_m) / (2.0 * h), epsilon = 1e-6);
        assert!(rho <= s + 1e-12);
    }

    #[test]
    fn test_losses_behave_like_l2_near_zero() {
        let losses: Vec<Box<dyn Loss>> = vec![
            Box::new(L2Loss),
            Box::new(HuberLoss::new(1.345).unwrap()),
            Box::new(CauchyLoss::new(2.3849).unwrap()),
            Box::new(GemanMcClureLoss::new(1.3998).unwrap()),
        ];
        for loss in &losses {
            let [rho, rho1, _] = loss.evaluate(0.0);
            assert_relative_eq!(rho, 0.0);
            assert_relative_eq!(rho1, 1.0);
        }
    }

    #[test]
    fn test_huber_regions() {
        let huber = HuberLoss::new(1.0).unwrap();
        assert_eq!(huber.evaluate(0.25), [0.25, 1.0, 0.0]);
        let [rho, rho1, _] = huber.evaluate(4.0);
        assert_relative_eq!(rho, 3.0);
        assert_relative_eq!(rho1, 0.5);
        check_derivatives(&huber, 4.0);
    }

    #[test]
    fn test_cauchy_derivatives() {
        let cauchy = CauchyLoss::new(2.0).unwrap();
        let [rho, _, _] = cauchy.evaluate(4.0);
        assert_relative_eq!(rho, 4.0 * 2f64.ln(), epsilon = 1e-12);
        check_derivatives(&cauchy, 0.7);
        check_derivatives(&cauchy, 30.0);
    }

    #[test]
    fn test_geman_mcclure_is_bounded() {
        let loss = GemanMcClureLoss::new(1.0).unwrap();
        assert!(loss.evaluate(1e9)[0] < 1.0);
        check_derivatives(&loss, 0.5);
        check_derivatives(&loss, 5.0);
    }

    #[test]
    fn test_invalid_scale() {
        assert!(matches!(
            HuberLoss::new(0.0),
            Err(PoseGraphError::InvalidInput(_))
        ));
        assert!(CauchyLoss::new(-1.0).is_err());
        assert!(GemanMcClureLoss::new(f64::NAN).is_err());
    }
}
