//! Sparse linear solvers.
//!
//! Each optimizer iteration produces a whitened Jacobian `J` and residual `r`. The solvers
//! compute the step `δ` of
//!
//! ```text
//! (JᵀJ + D) δ = -Jᵀr
//! ```
//!
//! where `D` is zero for Gauss-Newton and a non-negative diagonal for Levenberg-Marquardt.
//! Both implementations keep the matrices sparse (faer) and cache the symbolic factorization
//! while the sparsity pattern is unchanged.
//!
//! Singularity is reported as [`LinAlgError::SingularMatrix`] when the numeric factorization
//! fails, when the step is not finite, or when the factorization cannot reproduce a known
//! solution: the system is also solved for `b = A·1` and the result must match `1` within the
//! solver's singularity tolerance. The check catches rank deficiency that survives factorization
//! through round-off, such as the gauge freedom of an unanchored pose graph.

use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use std::fmt;
use thiserror::Error;

pub mod cholesky;
pub mod qr;

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = SparseColMat<usize, f64>;

/// Default tolerance of the reconstruction check
pub const DEFAULT_SINGULARITY_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinAlgError {
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("factorization failed: {0}")]
    FactorizationFailed(String),

    #[error("sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Linear solver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolverType {
    /// LLᵀ of the normal equations
    #[default]
    SparseCholesky,
    /// QR of the (augmented) Jacobian
    SparseQR,
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

pub trait SparseLinearSolver: Send {
    /// Solve `JᵀJ δ = -Jᵀr`.
    fn solve_normal_equation(
        &mut self,
        residual: &Mat<f64>,
        jacobian: &SparseMatrix,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve `(JᵀJ + diag(d)) δ = -Jᵀr` for a non-negative `damping_diagonal` `d`.
    fn solve_augmented_equation(
        &mut self,
        residual: &Mat<f64>,
        jacobian: &SparseMatrix,
        damping_diagonal: &[f64],
    ) -> LinAlgResult<Mat<f64>>;
}

pub fn create_linear_solver(
    solver_type: LinearSolverType,
    singularity_tolerance: f64,
) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(
            SparseCholeskySolver::new().with_singularity_tolerance(singularity_tolerance),
        ),
        LinearSolverType::SparseQR => {
            Box::new(SparseQRSolver::new().with_singularity_tolerance(singularity_tolerance))
        }
    }
}

fn check_system(residual: &Mat<f64>, jacobian: &SparseMatrix) -> LinAlgResult<()> {
    if residual.nrows() != jacobian.nrows() || residual.ncols() != 1 {
        return Err(LinAlgError::InvalidInput(format!(
            "residual is {}x{}, Jacobian has {} rows",
            residual.nrows(),
            residual.ncols(),
            jacobian.nrows()
        )));
    }
    Ok(())
}

fn check_damping(damping_diagonal: &[f64], n: usize) -> LinAlgResult<()> {
    if damping_diagonal.len() != n {
        return Err(LinAlgError::InvalidInput(format!(
            "damping has {} entries for {n} unknowns",
            damping_diagonal.len()
        )));
    }
    if let Some(bad) = damping_diagonal.iter().find(|d| !(**d >= 0.0 && d.is_finite())) {
        return Err(LinAlgError::InvalidInput(format!(
            "damping must be non-negative and finite, got {bad}"
        )));
    }
    Ok(())
}

/// `H = JᵀJ` and `g = -Jᵀr`
fn normal_equations(
    residual: &Mat<f64>,
    jacobian: &SparseMatrix,
) -> LinAlgResult<(SparseMatrix, Mat<f64>)> {
    let jacobian_t = jacobian
        .as_ref()
        .transpose()
        .to_col_major()
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("transpose: {e:?}")))?;
    let hessian = jacobian_t.as_ref() * jacobian.as_ref();
    let gradient = jacobian_t.as_ref() * (-residual);
    Ok((hessian, gradient))
}

/// Copy of a square `matrix` with `diagonal` summed onto its main diagonal.
fn with_diagonal(matrix: &SparseMatrix, diagonal: &[f64]) -> LinAlgResult<SparseMatrix> {
    let n = matrix.ncols();
    let symbolic = matrix.symbolic();
    let mut triplets = Vec::new();
    for col in 0..n {
        let row_indices = symbolic.row_idx_of_col_raw(col);
        let col_values = matrix.val_of_col(col);
        for (&row, &value) in row_indices.iter().zip(col_values) {
            triplets.push(Triplet::new(row, col, value));
        }
        triplets.push(Triplet::new(col, col, diagonal[col]));
    }
    SparseColMat::try_new_from_triplets(matrix.nrows(), n, &triplets)
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))
}

/// Row count, then per column its entry count and row indices; enough to tell two patterns
/// apart.
fn sparsity_pattern(matrix: &SparseMatrix) -> Vec<usize> {
    let symbolic = matrix.symbolic();
    let mut pattern = Vec::with_capacity(matrix.ncols() + 1);
    pattern.push(matrix.nrows());
    for col in 0..matrix.ncols() {
        let rows = symbolic.row_idx_of_col_raw(col);
        pattern.push(rows.len());
        pattern.extend_from_slice(rows);
    }
    pattern
}

/// Right-hand side with two columns: the gradient `g` and the image `A·1` of the ones vector.
fn with_reconstruction(gradient: &Mat<f64>, image: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(gradient.nrows(), 2, |i, j| {
        if j == 0 {
            gradient[(i, 0)]
        } else {
            image[(i, 0)]
        }
    })
}

/// Split a two-column solution into the step, rejecting non-finite steps and a failed
/// reconstruction.
fn checked_step(solution: &Mat<f64>, n: usize, tolerance: f64) -> LinAlgResult<Mat<f64>> {
    let mut reconstruction_error: f64 = 0.0;
    for i in 0..n {
        if !solution[(i, 0)].is_finite() {
            return Err(LinAlgError::SingularMatrix(format!(
                "non-finite step component at index {i}"
            )));
        }
        let deviation = (solution[(i, 1)] - 1.0).abs();
        if deviation.is_nan() {
            reconstruction_error = f64::INFINITY;
        } else {
            reconstruction_error = reconstruction_error.max(deviation);
        }
    }
    if reconstruction_error > tolerance {
        return Err(LinAlgError::SingularMatrix(format!(
            "reconstruction error {reconstruction_error:.3e} exceeds tolerance {tolerance:.1e}"
        )));
    }
    Ok(Mat::from_fn(n, 1, |i, _| solution[(i, 0)]))
}

fn ones(n: usize) -> Mat<f64> {
    Mat::from_fn(n, 1, |_, _| 1.0)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Small overdetermined, full-rank Jacobian (4x3).
    pub fn well_posed() -> (SparseMatrix, Mat<f64>) {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 1.5),
            Triplet::new(2, 1, -0.5),
            Triplet::new(2, 2, 1.0),
            Triplet::new(3, 2, 3.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(4, 3, &triplets).unwrap();
        let residual = Mat::from_fn(4, 1, |i, _| [1.0, -2.0, 0.5, 3.0][i]);
        (jacobian, residual)
    }

    /// Two columns that always move together: rank 1.
    pub fn rank_deficient() -> (SparseMatrix, Mat<f64>) {
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, -1.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, -2.0),
            Triplet::new(2, 0, -1.0),
            Triplet::new(2, 1, 1.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(3, 2, &triplets).unwrap();
        let residual = Mat::from_fn(3, 1, |i, _| [1.0, 0.5, -1.0][i]);
        (jacobian, residual)
    }

    /// Dense reference solution of `(JᵀJ + diag(d)) x = -Jᵀr`.
    pub fn dense_reference(
        jacobian: &SparseMatrix,
        residual: &Mat<f64>,
        damping: &[f64],
    ) -> Vec<f64> {
        let dense = jacobian.to_dense();
        let m = dense.nrows();
        let n = dense.ncols();
        let j = nalgebra::DMatrix::from_fn(m, n, |r, c| dense[(r, c)]);
        let r = nalgebra::DVector::from_fn(m, |i, _| residual[(i, 0)]);
        let mut h = j.transpose() * &j;
        for (i, d) in damping.iter().enumerate() {
            h[(i, i)] += d;
        }
        let g = -(j.transpose() * r);
        let x = h.lu().solve(&g).unwrap();
        x.iter().copied().collect()
    }
}
