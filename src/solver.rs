//! The linear solver at the bottom of every fit.
//!
//! Normal-equation systems M·a = b coming out of the stamp builder are
//! symmetric positive semi-definite. The solver first attempts a full-pivot
//! LU decomposition; when M turns out singular it falls back to the
//! Moore–Penrose pseudo-inverse built from the symmetric eigendecomposition,
//! inverting only eigenvalues above a caller-supplied tolerance.

use crate::{
    config::ConditionNumberKind,
    error::{Error, Result},
};
use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Iteration cap for the symmetric eigendecomposition.
const EIGEN_MAX_ITERATIONS: usize = 1024;

/// How a linear system was ultimately solved.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SolvedBy {
    /// No successful solve has happened.
    #[default]
    None,
    /// Full-pivot LU decomposition on an invertible M.
    Lu,
    /// Pseudo-inverse from the symmetric eigendecomposition of a singular M.
    Eigenvector,
}

/// Solves symmetric positive semi-definite systems with automatic fallback.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LinearSolver {
    /// Eigenvalues with absolute value at or below this are left at zero by
    /// the pseudo-inverse fallback. Zero, the default, means only exactly
    /// zero eigenvalues are excluded from inversion.
    pub eigen_tolerance: f64,
}

impl LinearSolver {
    /// Creates a solver with the given pseudo-inverse tolerance.
    #[must_use]
    pub const fn new(eigen_tolerance: f64) -> Self {
        Self { eigen_tolerance }
    }

    /// Solves M·a = b.
    ///
    /// # Errors
    /// * [`Error::SizeMismatch`] when M is not square of b's length.
    /// * [`Error::EigenDecompositionFailed`] when M is singular and the
    ///   eigendecomposition fallback does not converge.
    /// * [`Error::NonFiniteCoefficients`] when the solution contains NaN.
    pub fn solve(&self, m: &DMatrix<f64>, b: &DVector<f64>) -> Result<(DVector<f64>, SolvedBy)> {
        if m.nrows() != m.ncols() || m.nrows() != b.len() {
            return Err(Error::SizeMismatch {
                expected: b.len() * b.len(),
                received: m.nrows() * m.ncols(),
            });
        }

        let lu = m.clone().full_piv_lu();
        let (a, solved_by) = if lu.is_invertible() {
            let a = lu.solve(b).ok_or(Error::InternalInvariant(
                "full-pivot LU failed to solve an invertible system",
            ))?;
            (a, SolvedBy::Lu)
        } else {
            debug!(
                "normal equations of size {} are singular, falling back to eigendecomposition",
                m.nrows(),
            );
            let a = self.pseudo_inverse_solve(m, b)?;
            (a, SolvedBy::Eigenvector)
        };

        if a.iter().any(|value| value.is_nan()) {
            return Err(Error::NonFiniteCoefficients {
                condition_number: condition_number(m, ConditionNumberKind::Eigenvalue)
                    .unwrap_or(f64::NAN),
            });
        }
        Ok((a, solved_by))
    }

    fn pseudo_inverse_solve(&self, m: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        let eigen = SymmetricEigen::try_new(m.clone(), f64::EPSILON, EIGEN_MAX_ITERATIONS)
            .ok_or(Error::EigenDecompositionFailed)?;

        let inverted = eigen.eigenvalues.map(|e| {
            if e.abs() <= self.eigen_tolerance {
                0.0
            } else {
                1.0 / e
            }
        });

        let r = &eigen.eigenvectors;
        Ok(r * DMatrix::from_diagonal(&inverted) * r.transpose() * b)
    }
}

/// The condition number of a symmetric matrix.
///
/// # Errors
/// * [`Error::EigenDecompositionFailed`] when the decomposition backing the
///   requested kind does not converge.
pub fn condition_number(m: &DMatrix<f64>, kind: ConditionNumberKind) -> Result<f64> {
    match kind {
        ConditionNumberKind::Eigenvalue => {
            let eigen = SymmetricEigen::try_new(m.clone(), f64::EPSILON, EIGEN_MAX_ITERATIONS)
                .ok_or(Error::EigenDecompositionFailed)?;
            Ok(eigen.eigenvalues.amax() / eigen.eigenvalues.amin())
        }
        ConditionNumberKind::Svd => {
            let singular = m.clone().svd(false, false).singular_values;
            Ok(singular.max() / singular.min())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn invertible_system_uses_lu() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);

        let (a, solved_by) = LinearSolver::default().solve(&m, &b).unwrap();
        assert_eq!(solved_by, SolvedBy::Lu);
        assert_relative_eq!((&m * &a - &b).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_system_falls_back() {
        // Rank one: second row is twice the first.
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);

        let (a, solved_by) = LinearSolver::default().solve(&m, &b).unwrap();
        assert_eq!(solved_by, SolvedBy::Eigenvector);
        // The pseudo-inverse solution still satisfies the consistent system.
        assert_relative_eq!((&m * &a - &b).norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn pseudo_inverse_solution_lies_in_the_row_space() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_vec(vec![2.0, 2.0]);

        let (a, _) = LinearSolver::default().solve(&m, &b).unwrap();
        // Row space of m is spanned by (1, 1); the minimum-norm solution has
        // equal components.
        assert_relative_eq!(a[0], a[1], epsilon = 1e-12);
        assert_relative_eq!(a[0] + a[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn condition_number_of_identity() {
        let m = DMatrix::<f64>::identity(4, 4);
        let eigen = condition_number(&m, ConditionNumberKind::Eigenvalue).unwrap();
        let svd = condition_number(&m, ConditionNumberKind::Svd).unwrap();
        assert_relative_eq!(eigen, 1.0, epsilon = 1e-12);
        assert_relative_eq!(svd, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let m = DMatrix::<f64>::identity(3, 3);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        assert!(matches!(
            LinearSolver::default().solve(&m, &b),
            Err(Error::SizeMismatch { .. }),
        ));
    }
}
