use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::{Mat, Side};

use super::{
    DEFAULT_SINGULARITY_TOLERANCE, LinAlgError, LinAlgResult, SparseLinearSolver, SparseMatrix,
    check_damping, check_system, checked_step, normal_equations, ones, sparsity_pattern,
    with_diagonal, with_reconstruction,
};

/// Sparse LLᵀ solver of the normal equations `H δ = g`, `H = JᵀJ (+ D)`, `g = -Jᵀr`.
///
/// The symbolic analysis is kept between calls and redone only when the sparsity pattern of
/// `H` changes, which for a fixed graph means it is computed once per optimization.
#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    symbolic_pattern: Option<(Vec<usize>, solvers::SymbolicLlt<usize>)>,
    singularity_tolerance: f64,
}

impl SparseCholeskySolver {
    /// Create a solver with the default singularity tolerance and an empty symbolic cache.
    pub fn new() -> Self {
        SparseCholeskySolver {
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
        hessian: &SparseMatrix,
    ) -> LinAlgResult<solvers::SymbolicLlt<usize>> {
        let pattern = sparsity_pattern(hessian);
        if let Some((cached, symbolic)) = &self.symbolic_pattern {
            if *cached == pattern {
                return Ok(symbolic.clone());
            }
        }
        let symbolic = solvers::SymbolicLlt::try_new(hessian.symbolic(), Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("symbolic LLT: {e:?}")))?;
        self.symbolic_pattern = Some((pattern, symbolic.clone()));
        Ok(symbolic)
    }

    fn factor_and_solve(
        &mut self,
        hessian: &SparseMatrix,
        gradient: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let n = hessian.ncols();
        if n == 0 {
            return Ok(Mat::zeros(0, 1));
        }

        let symbolic = self.symbolic_for(hessian)?;
        let cholesky =
            solvers::Llt::try_new_with_symbolic(symbolic, hessian.as_ref(), Side::Lower).map_err(
                |e| LinAlgError::SingularMatrix(format!("Cholesky factorization: {e:?}")),
            )?;

        let image = hessian.as_ref() * ones(n);
        let solution = cholesky.solve(with_reconstruction(gradient, &image));
        checked_step(&solution, n, self.singularity_tolerance)
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residual: &Mat<f64>,
        jacobian: &SparseMatrix,
    ) -> LinAlgResult<Mat<f64>> {
        check_system(residual, jacobian)?;
        let (hessian, gradient) = normal_equations(residual, jacobian)?;
        self.factor_and_solve(&hessian, &gradient)
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
        self.factor_and_solve(&damped, &gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{dense_reference, rank_deficient, well_posed};
    use super::*;
    use approx::assert_relative_eq;

    const TOLERANCE: f64 = 1e-10;

    #[test]
    fn test_normal_equation_matches_dense() {
        let (jacobian, residual) = well_posed();
        let mut solver = SparseCholeskySolver::new();
        let step = solver.solve_normal_equation(&residual, &jacobian).unwrap();
        let expected = dense_reference(&jacobian, &residual, &[0.0; 3]);
        for i in 0..3 {
            assert_relative_eq!(step[(i, 0)], expected[i], epsilon = TOLERANCE);
        }
    }

    #[test]
    fn test_augmented_equation_matches_dense() {
        let (jacobian, residual) = well_posed();
        let damping = [0.5, 2.0, 0.1];
        let mut solver = SparseCholeskySolver::new();
        let step = solver
            .solve_augmented_equation(&residual, &jacobian, &damping)
            .unwrap();
        let expected = dense_reference(&jacobian, &residual, &damping);
        for i in 0..3 {
            assert_relative_eq!(step[(i, 0)], expected[i], epsilon = TOLERANCE);
        }
    }

    #[test]
    fn test_symbolic_cache_reused() {
        let (jacobian, residual) = well_posed();
        let mut solver = SparseCholeskySolver::new();
        let first = solver.solve_normal_equation(&residual, &jacobian).unwrap();
        assert!(solver.symbolic_pattern.is_some());
        let second = solver.solve_normal_equation(&residual, &jacobian).unwrap();
        for i in 0..3 {
            assert_eq!(first[(i, 0)], second[(i, 0)]);
        }

        // a different pattern triggers a new analysis instead of a failure
        let (deficient, deficient_residual) = rank_deficient();
        let damped = solver
            .solve_augmented_equation(&deficient_residual, &deficient, &[1.0, 1.0])
            .unwrap();
        assert_eq!(damped.nrows(), 2);
    }

    #[test]
    fn test_rank_deficient_is_singular() {
        let (jacobian, residual) = rank_deficient();
        let mut solver = SparseCholeskySolver::new();
        let result = solver.solve_normal_equation(&residual, &jacobian);
        assert!(matches!(result, Err(LinAlgError::SingularMatrix(_))));
    }

    #[test]
    fn test_invalid_inputs() {
        let (jacobian, residual) = well_posed();
        let mut solver = SparseCholeskySolver::new();
        assert!(matches!(
            solver.solve_augmented_equation(&residual, &jacobian, &[1.0]),
            Err(LinAlgError::InvalidInput(_))
        ));
        let short = Mat::<f64>::zeros(2, 1);
        assert!(solver.solve_normal_equation(&short, &jacobian).is_err());
    }
}
