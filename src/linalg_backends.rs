// src/linalg_backends.rs

use crate::error::{FactorError, FactorResult};
use ndarray::{Array1, Array2, Axis};
use std::error::Error;
use std::marker::PhantomData;

/// Relative eigenvalue floor below which a symmetric matrix is treated as singular.
pub const SINGULAR_RELATIVE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

pub type BackendError = Box<dyn Error + Send + Sync>;

// --- Trait Definitions ---

/// Output of a symmetric eigendecomposition.
#[derive(Debug, Clone)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues. Ascending as returned by LAPACK; descending after `symmetric_eigen_descending`.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Trait for symmetric eigendecomposition (LAPACK's DSYEVD family).
/// Implementers may assume `matrix` is symmetric and read only its upper triangle.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, BackendError>;
}

/// Trait for the inverse of a general square matrix (LU based).
pub trait BackendInverse<F: 'static + Copy + Send + Sync> {
    fn inverse(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError>;
}

/// Trait for the lower Cholesky factor of a symmetric positive-definite matrix.
pub trait BackendCholesky<F: 'static + Copy + Send + Sync> {
    fn cholesky_lower(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{Cholesky as NdLinalgCholesky, Eigh as NdLinalgEigh, Inverse as NdLinalgInverse, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

// Helper to convert ndarray-linalg's error to Box<dyn Error + Send + Sync>
fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> BackendError {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, BackendError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendInverse<f64> for NdarrayLinAlgBackend {
    fn inverse(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
        matrix.inv().map_err(to_dyn_error)
    }
}

impl BackendCholesky<f64> for NdarrayLinAlgBackend {
    fn cholesky_lower(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
        matrix.cholesky(UPLO::Lower).map_err(to_dyn_error)
    }
}

// --- LinAlgBackendProvider Dispatch ---

impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, BackendError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl<F> BackendInverse<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendInverse<F>,
{
    fn inverse(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError> {
        NdarrayLinAlgBackend.inverse(matrix)
    }
}

impl<F> BackendCholesky<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendCholesky<F>,
{
    fn cholesky_lower(&self, matrix: &Array2<F>) -> Result<Array2<F>, BackendError> {
        NdarrayLinAlgBackend.cholesky_lower(matrix)
    }
}

// --- Engine-level helpers built on the provider ---

/// Symmetric eigendecomposition with eigenpairs sorted by descending eigenvalue.
///
/// Ties keep the order the backend returned them in, which is solver dependent.
pub fn symmetric_eigen_descending(matrix: &Array2<f64>) -> FactorResult<EighOutput<f64>> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let EighOutput { eigenvalues, eigenvectors } = backend
        .eigh_upper(matrix)
        .map_err(|e| FactorError::Linalg(format!("Symmetric eigendecomposition failed: {}", e)))?;

    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::Linalg(
            "Symmetric eigendecomposition produced non-finite eigenvalues.".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(EighOutput {
        eigenvalues: eigenvalues.select(Axis(0), &order),
        eigenvectors: eigenvectors.select(Axis(1), &order),
    })
}

/// Reassembles `V diag(f(lambda)) V^T` from a descending eigendecomposition.
fn reassemble(decomposition: &EighOutput<f64>, f: impl Fn(f64) -> f64) -> Array2<f64> {
    let scaled_values = decomposition.eigenvalues.mapv(f);
    let scaled_vectors = &decomposition.eigenvectors * &scaled_values;
    scaled_vectors.dot(&decomposition.eigenvectors.t())
}

fn check_symmetric_invertible(
    decomposition: &EighOutput<f64>,
    context: &str,
) -> FactorResult<()> {
    let largest = decomposition.eigenvalues.iter().cloned().fold(0.0_f64, f64::max);
    let smallest = decomposition
        .eigenvalues
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    if largest <= 0.0 || smallest <= SINGULAR_RELATIVE_TOLERANCE * largest {
        return Err(FactorError::SingularMatrix(format!(
            "{} (eigenvalue range [{:.3e}, {:.3e}])",
            context, smallest, largest
        )));
    }
    Ok(())
}

/// Inverse of a symmetric positive-definite matrix through its eigendecomposition.
///
/// Fails with `SingularMatrix` when the smallest eigenvalue is not clearly positive
/// relative to the largest, which catches perfectly collinear variables that an LU
/// factorization can let through with a tiny pivot.
pub fn symmetric_inverse(matrix: &Array2<f64>, context: &str) -> FactorResult<Array2<f64>> {
    let decomposition = symmetric_eigen_descending(matrix)?;
    check_symmetric_invertible(&decomposition, context)?;
    Ok(reassemble(&decomposition, |v| 1.0 / v))
}

/// Inverse square root `M^(-1/2)` of a symmetric positive-definite matrix.
pub fn symmetric_inverse_sqrt(matrix: &Array2<f64>, context: &str) -> FactorResult<Array2<f64>> {
    let decomposition = symmetric_eigen_descending(matrix)?;
    check_symmetric_invertible(&decomposition, context)?;
    Ok(reassemble(&decomposition, |v| 1.0 / v.sqrt()))
}

/// Inverse of a general square matrix.
pub fn general_inverse(matrix: &Array2<f64>, context: &str) -> FactorResult<Array2<f64>> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let inverse = backend
        .inverse(matrix)
        .map_err(|e| FactorError::SingularMatrix(format!("{}: {}", context, e)))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::SingularMatrix(format!(
            "{}: inverse contains non-finite values",
            context
        )));
    }
    Ok(inverse)
}

/// Lower Cholesky factor `C` with `C C^T = matrix`.
pub fn cholesky_lower(matrix: &Array2<f64>, context: &str) -> FactorResult<Array2<f64>> {
    let backend = LinAlgBackendProvider::<f64>::new();
    backend
        .cholesky_lower(matrix)
        .map_err(|e| FactorError::InvalidInput(format!("{}: {}", context, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigenpairs_are_sorted_descending() {
        let m = array![[2.0, 0.5, 0.0], [0.5, 3.0, 0.2], [0.0, 0.2, 1.0]];
        let eig = symmetric_eigen_descending(&m).unwrap();
        for w in eig.eigenvalues.windows(2) {
            assert!(w[0] >= w[1]);
        }
        // A v = lambda v still holds after reordering.
        for (i, &lambda) in eig.eigenvalues.iter().enumerate() {
            let v = eig.eigenvectors.column(i);
            let av = m.dot(&v);
            for r in 0..3 {
                assert_abs_diff_eq!(av[r], lambda * v[r], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn symmetric_inverse_matches_identity() {
        let m = array![[1.0, 0.3], [0.3, 1.0]];
        let inv = symmetric_inverse(&m, "test").unwrap();
        let product = m.dot(&inv);
        assert_abs_diff_eq!(product[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(product[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(product[[1, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn symmetric_inverse_rejects_collinear_matrix() {
        let m = array![[1.0, 1.0, 0.2], [1.0, 1.0, 0.2], [0.2, 0.2, 1.0]];
        match symmetric_inverse(&m, "collinear") {
            Err(FactorError::SingularMatrix(msg)) => assert!(msg.contains("collinear")),
            other => panic!("expected SingularMatrix, got {:?}", other),
        }
    }

    #[test]
    fn inverse_sqrt_squares_to_inverse() {
        let m = array![[2.0, 0.4], [0.4, 1.5]];
        let inv_sqrt = symmetric_inverse_sqrt(&m, "test").unwrap();
        let inv = symmetric_inverse(&m, "test").unwrap();
        let squared = inv_sqrt.dot(&inv_sqrt);
        for (a, b) in squared.iter().zip(inv.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let m = array![[1.0, 0.5], [0.5, 1.0]];
        let c = cholesky_lower(&m, "test").unwrap();
        let back = c.dot(&c.t());
        for (a, b) in back.iter().zip(m.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
