use faer::linalg::solvers::SolveLstsqCore;
use faer::sparse::linalg::solvers;
use faer::{Conj, Mat};

use super::{
    DEFAULT_SINGULARITY_TOLERANCE, LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix,
    check_damping, check_system, checked_step, normal_equations, ones, sparsity_pattern,
    with_diagonal, with_reconstruction,
};

/// Sparse QR least-squares solver.
///
/// Gauss-Newton steps solve `min ‖J δ + r‖` directly on the Jacobian, avoiding the squared
/// condition number of the normal equations. Damped steps factor the square system
///
/// ```text
/// (JᵀJ + D) δ = -Jᵀr
/// ```
///
/// which keeps the sparsity of the Hessian: stacking `√D` under `J` instead produces a tall
/// matrix whose QR fill grows with the variable count even on a chain.
#[derive(Debug, Clone)]
pub struct SparseQRSolver {
    symbolic_pattern: Option<(Vec<usize>, solvers::SymbolicQr<usize>)>,
    singularity_tolerance: f64,
}

impl SparseQRSolver {
    /// Create a solver with the default singularity tolerance and an empty symbolic cache.
    pub fn new() -> Self {
        SparseQRSolver {
            symbolic_pattern: None,
            singularity_tolerance: DEFAULT_SINGULARITY_TOLERANCE,
        }
    }

    /// Set the largest accepted deviation of the reconstruction check.
    pub fn with_singularity_tolerance(mut self, tolerance: f64) -> Self {
        self.singularity_tolerance = tolerance;
        self
    }

    fn symbolic_for(
        &mut self,
        matrix: &SparseMatrix,
    ) -> LinAlgResult<solvers::SymbolicQr<usize>> {
        let pattern = sparsity_pattern(matrix);
        if let Some((cached, symbolic)) = &self.symbolic_pattern {
            if *cached == pattern {
                return Ok(symbolic.clone());
            }
        }
        let analysed = solvers::SymbolicQr::try_new(matrix.symbolic())
            .map_err(|e| LinAlgError::FactorizationFailed(format!("symbolic QR: {e:?}")))?;
        self.symbolic_pattern = Some((pattern, analysed.clone()));
        Ok(analysed)
    }

    /// Least squares `min ‖A x - b‖`, solved together with the column `A·1`.
    fn lstsq(&mut self, matrix: &SparseMatrix, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let m = matrix.nrows();
        let n = matrix.ncols();
        if n == 0 {
            return Ok(Mat::zeros(0, 1));
        }
        if m < n {
            return Err(LinAlgError::SingularMatrix(format!(
                "underdetermined system: {m} residuals for {n} unknowns"
            )));
        }

        let symbolic = self.symbolic_for(matrix)?;
        let qr = solvers::Qr::try_new_with_symbolic(symbolic, matrix.as_ref())
            .map_err(|e| LinAlgError::SingularMatrix(format!("QR factorization: {e:?}")))?;

        let image = matrix.as_ref() * ones(n);
        let mut solution = with_reconstruction(rhs, &image);
        qr.solve_lstsq_in_place_with_conj(Conj::No, solution.as_mut());
        checked_step(&solution, n, self.singularity_tolerance)
    }
}

impl Default for SparseQRSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_normal_equation(
        &mut self,
        residual: &Mat<f64>,
        jacobian: &SparseMatrix,
    ) -> LinAlgResult<Mat<f64>> {
        check_system(residual, jacobian)?;
        self.lstsq(jacobian, &(-residual))
    }

    fn solve_augmented_equation(
        &mut self,
        residual: &Mat<f64>,
        jacobian: &SparseMatrix,
        damping_diagonal: &[f64],
    ) -> LinAlgResult<Mat<f64>> {
        check_system(residual, jacobian)?;
        check_damping(damping_diagonal, jacobian.ncols())?;
        let (hessian, gradient) = normal_equations(residual, jacobian)?;
        let damped = with_diagonal(&hessian, damping_diagonal)?;
        self.lstsq(&damped, &gradient)
    }
}
