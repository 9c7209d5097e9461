//! Covariance helpers shared by the Kalman step and the particle initialization.
//!
//! Covariances handed around the filter are symmetric positive semi-definite in exact arithmetic but drift off that
//! set through round-off. Both helpers here symmetrize first and then fall back through progressively more tolerant
//! factorizations:
//!
//! - [covariance_factor]: Cholesky, then a symmetric eigen-decomposition with negative eigenvalues clipped to zero.
//! - [spd_solve]: Cholesky, then Cholesky with a small diagonal loading, then a plain inverse.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, Matrix3};

/// First diagonal loading tried when a Cholesky factorization fails.
const LOADING_START: f64 = 1e-12;
/// Diagonal loading is never increased past this.
const LOADING_LIMIT: f64 = 1e-6;

/// `0.5 (m + mᵀ)`
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// A factor `L` with `L Lᵀ = covariance`, used to draw correlated Gaussian offsets as `L z`.
///
/// An all-zero covariance gives the zero factor. A positive definite covariance gives its lower Cholesky factor; a
/// semi-definite or slightly indefinite one gives the symmetric square root of its clipped spectrum.
pub fn covariance_factor(covariance: &Matrix3<f64>) -> Matrix3<f64> {
    if covariance.iter().all(|v| *v == 0.0) {
        return Matrix3::zeros();
    }
    let sym = 0.5 * (covariance + covariance.transpose());
    if let Some(chol) = Cholesky::new(sym) {
        return chol.l();
    }
    let eigen = SymmetricEigen::new(sym);
    let roots = eigen.eigenvalues.map(|l| l.max(0.0).sqrt());
    eigen.eigenvectors * Matrix3::from_diagonal(&roots) * eigen.eigenvectors.transpose()
}

/// Solve `a x = b` for a symmetric positive (semi-)definite `a`.
///
/// `None` only if `a` stays singular after diagonal loading and has no inverse.
///
/// # Panics
/// If `a` is not square or `b` has a different number of rows.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    assert!(a.is_square(), "spd_solve: a must be square");
    assert_eq!(a.nrows(), b.nrows(), "spd_solve: a and b have different row counts");

    let sym = symmetrize(a);
    let mut loading = 0.0;
    while loading <= LOADING_LIMIT {
        let mut loaded = sym.clone();
        loaded.iter_mut().step_by(sym.nrows() + 1).for_each(|d| *d += loading);
        if let Some(chol) = Cholesky::new(loaded) {
            return Some(chol.solve(b));
        }
        loading = if loading == 0.0 { LOADING_START } else { loading * 10.0 };
    }
    sym.try_inverse().map(|inv| inv * b)
}
