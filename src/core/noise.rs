//! Gaussian noise models.
//!
//! A [`GaussianNoise`] stores the upper-triangular square-root information matrix `R` with
//! `RᵀR = Λ = Σ⁻¹`. Whitening multiplies residuals and Jacobians by `R`, so that minimizing
//! `½‖R r‖²` is maximum likelihood under `r ~ N(0, Σ)`.

use crate::error::{PoseGraphError, PoseGraphResult};
use nalgebra::{DMatrix, DVector};

const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianNoise {
    sqrt_information: DMatrix<f64>,
}

impl GaussianNoise {
    /// Unit information.
    pub fn identity(dim: usize) -> Self {
        GaussianNoise {
            sqrt_information: DMatrix::identity(dim, dim),
        }
    }

    /// Isotropic noise with standard deviation `sigma` on every component.
    pub fn from_scalar_sigma(dim: usize, sigma: f64) -> PoseGraphResult<Self> {
        Self::from_diagonal_sigmas(&vec![sigma; dim])
    }

    /// Independent components with standard deviations `sigmas`.
    ///
    /// # Errors
    /// `InvalidInput` if `sigmas` is empty or holds a non-positive or non-finite entry.
    pub fn from_diagonal_sigmas(sigmas: &[f64]) -> PoseGraphResult<Self> {
        check_positive(sigmas, "sigma")?;
        let inv: Vec<f64> = sigmas.iter().map(|s| 1.0 / s).collect();
        Ok(GaussianNoise {
            sqrt_information: DMatrix::from_diagonal(&DVector::from_vec(inv)),
        })
    }

    pub fn from_diagonal_variances(variances: &[f64]) -> PoseGraphResult<Self> {
        check_positive(variances, "variance")?;
        let sigmas: Vec<f64> = variances.iter().map(|v| v.sqrt()).collect();
        Self::from_diagonal_sigmas(&sigmas)
    }

    /// From a symmetric positive-definite information matrix, via Cholesky `Λ = LLᵀ`, `R = Lᵀ`.
    pub fn from_information(information: DMatrix<f64>) -> PoseGraphResult<Self> {
        check_symmetric(&information, "information")?;
        let cholesky = information.cholesky().ok_or_else(|| {
            PoseGraphError::InvalidInput("information matrix is not positive definite".into())
        })?;
        Ok(GaussianNoise {
            sqrt_information: cholesky.l().transpose(),
        })
    }

    /// From a symmetric positive-definite covariance; the covariance is inverted once here.
    pub fn from_covariance(covariance: DMatrix<f64>) -> PoseGraphResult<Self> {
        check_symmetric(&covariance, "covariance")?;
        let cholesky = covariance.cholesky().ok_or_else(|| {
            PoseGraphError::InvalidInput("covariance matrix is not positive definite".into())
        })?;
        let information = cholesky.inverse();
        // symmetrize away round-off before the second factorization
        let information = (&information + information.transpose()) * 0.5;
        Self::from_information(information)
    }

    pub fn dim(&self) -> usize {
        self.sqrt_information.nrows()
    }

    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    pub fn information(&self) -> DMatrix<f64> {
        self.sqrt_information.transpose() * &self.sqrt_information
    }

    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        &self.sqrt_information * residual
    }

    pub fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> DMatrix<f64> {
        &self.sqrt_information * jacobian
    }
}

fn check_positive(values: &[f64], what: &str) -> PoseGraphResult<()> {
    if values.is_empty() {
        return Err(PoseGraphError::InvalidInput(format!(
            "noise model needs at least one {what}"
        )));
    }
    match values.iter().find(|v| !(**v > 0.0 && v.is_finite())) {
        Some(bad) => Err(PoseGraphError::InvalidInput(format!(
            "{what} must be positive and finite, got {bad}"
        ))),
        None => Ok(()),
    }
}

fn check_symmetric(matrix: &DMatrix<f64>, what: &str) -> PoseGraphResult<()> {
    if !matrix.is_square() || matrix.nrows() == 0 {
        return Err(PoseGraphError::InvalidInput(format!(
            "{what} matrix must be square and non-empty, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    let scale = matrix.amax().max(1.0);
    if (matrix - matrix.transpose()).amax() > SYMMETRY_TOLERANCE * scale {
        return Err(PoseGraphError::InvalidInput(format!(
            "{what} matrix is not symmetric"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_diagonal_sigmas_whiten() {
        let noise = GaussianNoise::from_diagonal_sigmas(&[0.1, 0.5, 2.0]).unwrap();
        let whitened = noise.whiten(&DVector::from_vec(vec![1.0, 1.0, 1.0]));
        assert_relative_eq!(whitened, DVector::from_vec(vec![10.0, 2.0, 0.5]), epsilon = 1e-12);
    }

    #[test]
    fn test_variances_match_sigmas() {
        let a = GaussianNoise::from_diagonal_variances(&[1e-6, 1e-4]).unwrap();
        let b = GaussianNoise::from_diagonal_sigmas(&[1e-3, 1e-2]).unwrap();
        assert_relative_eq!(a.sqrt_information(), b.sqrt_information(), epsilon = 1e-9);
    }

    #[test]
    fn test_information_round_trip() {
        let information = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let noise = GaussianNoise::from_information(information.clone()).unwrap();
        assert_relative_eq!(noise.information(), information, epsilon = 1e-12);
        // upper triangular
        assert_relative_eq!(noise.sqrt_information()[(1, 0)], 0.0);
    }

    #[test]
    fn test_covariance_inverts() {
        let covariance = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let noise = GaussianNoise::from_covariance(covariance.clone()).unwrap();
        let product = noise.information() * covariance;
        assert_relative_eq!(product, DMatrix::identity(2, 2), epsilon = 1e-10);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(GaussianNoise::from_scalar_sigma(3, 0.0).is_err());
        assert!(GaussianNoise::from_diagonal_sigmas(&[]).is_err());
        let not_spd = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            GaussianNoise::from_information(not_spd),
            Err(PoseGraphError::InvalidInput(_))
        ));
        let not_symmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(GaussianNoise::from_information(not_symmetric).is_err());
        assert!(GaussianNoise::from_information(DMatrix::zeros(2, 3)).is_err());
    }
}
