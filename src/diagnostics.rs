// src/diagnostics.rs

use crate::correlation::CorrelationMatrix;
use crate::error::{FactorError, FactorResult};
use crate::linalg_backends::{symmetric_eigen_descending, symmetric_inverse, SINGULAR_RELATIVE_TOLERANCE};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

// --- Struct Definitions ---

/// Kaiser-Meyer-Olkin measure of sampling adequacy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingAdequacy {
    pub overall: f64,                           // Pooled over all off-diagonal pairs
    pub per_variable: Array1<f64>,              // MSA of each variable against all others
}

/// Bartlett's test that the correlation matrix is an identity matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SphericityTest {
    pub chi_square: f64,
    pub degrees_of_freedom: usize,              // p(p-1)/2
    pub n_observations: usize,
}

/// How well a fitted solution reproduces the input matrix, plus the adequacy checks
/// usually reported with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub residuals: Array2<f64>,                 // R - P Phi P^T, zero diagonal
    pub rmsr: f64,                              // Root mean square off-diagonal residual
    pub sampling_adequacy: Option<SamplingAdequacy>, // None when R is singular
    pub sphericity: Option<SphericityTest>,     // None without an observation count
}

// --- Computations ---

/// Residual correlations `R - P Phi P^T` with the diagonal set to zero.
/// `factor_correlation = None` means orthogonal factors.
pub fn residual_matrix(
    matrix: ArrayView2<f64>,
    loadings: ArrayView2<f64>,
    factor_correlation: Option<ArrayView2<f64>>,
) -> FactorResult<Array2<f64>> {
    let p = matrix.nrows();
    if matrix.ncols() != p || loadings.nrows() != p {
        return Err(FactorError::InvalidInput(format!(
            "Residuals need a square matrix matching the loadings; got {:?} and {:?}.",
            matrix.dim(),
            loadings.dim()
        )));
    }
    let implied = match factor_correlation {
        Some(phi) => loadings.dot(&phi).dot(&loadings.t()),
        None => loadings.dot(&loadings.t()),
    };
    let mut residuals = &matrix - &implied;
    residuals.diag_mut().fill(0.0);
    Ok(residuals)
}

/// Root mean square of the off-diagonal residuals.
pub fn root_mean_square_residual(residuals: ArrayView2<f64>) -> f64 {
    let p = residuals.nrows();
    if p < 2 {
        return 0.0;
    }
    let mut sum_sq = 0.0;
    for ((i, j), &v) in residuals.indexed_iter() {
        if i != j {
            sum_sq += v * v;
        }
    }
    (sum_sq / (p * (p - 1)) as f64).sqrt()
}

/// Kaiser-Meyer-Olkin adequacy from the correlations and the anti-image (partial)
/// correlations `-inv_ij / sqrt(inv_ii inv_jj)`. Covariance input is rescaled first.
///
/// # Errors
/// `SingularMatrix` if R cannot be inverted; `DegenerateInput` if every off-diagonal
/// correlation of some variable is zero.
pub fn kaiser_meyer_olkin(corr: &CorrelationMatrix) -> FactorResult<SamplingAdequacy> {
    let standardized = corr.to_correlation();
    let r = standardized.matrix();
    let p = r.nrows();
    let inverse = symmetric_inverse(r, "sampling adequacy needs an invertible correlation matrix")?;

    let mut r_sq = Array1::<f64>::zeros(p);
    let mut partial_sq = Array1::<f64>::zeros(p);
    for i in 0..p {
        for j in 0..p {
            if i == j {
                continue;
            }
            let partial = -inverse[[i, j]] / (inverse[[i, i]] * inverse[[j, j]]).sqrt();
            r_sq[i] += r[[i, j]].powi(2);
            partial_sq[i] += partial * partial;
        }
    }

    if let Some(i) = r_sq.iter().position(|&v| v == 0.0) {
        return Err(FactorError::DegenerateInput(format!(
            "variable {} is uncorrelated with every other variable; sampling adequacy is undefined",
            i
        )));
    }

    let per_variable = &r_sq / &(&r_sq + &partial_sq);
    let overall = r_sq.sum() / (r_sq.sum() + partial_sq.sum());
    debug!("KMO overall {:.4}, per variable {:.4}", overall, per_variable);
    Ok(SamplingAdequacy { overall, per_variable })
}

/// Bartlett's sphericity statistic `-(n - 1 - (2p + 5)/6) ln|R|` on `p(p-1)/2` degrees
/// of freedom. No p-value is computed.
///
/// # Errors
/// `InvalidInput` when the multiplier is not positive (too few observations);
/// `SingularMatrix` when `|R|` is not positive.
pub fn bartlett_sphericity(corr: &CorrelationMatrix, n_observations: usize) -> FactorResult<SphericityTest> {
    let standardized = corr.to_correlation();
    let p = standardized.n_variables();
    let multiplier = n_observations as f64 - 1.0 - (2.0 * p as f64 + 5.0) / 6.0;
    if multiplier <= 0.0 {
        return Err(FactorError::InvalidInput(format!(
            "Sphericity test needs more observations: n = {} for {} variables.",
            n_observations, p
        )));
    }
    let eigen = symmetric_eigen_descending(standardized.matrix())?;
    let largest = eigen.eigenvalues[0];
    if eigen.eigenvalues.iter().any(|&v| v <= SINGULAR_RELATIVE_TOLERANCE * largest) {
        return Err(FactorError::SingularMatrix(
            "sphericity test needs a positive determinant".to_string(),
        ));
    }
    let log_det: f64 = eigen.eigenvalues.iter().map(|v| v.ln()).sum();
    Ok(SphericityTest {
        chi_square: -multiplier * log_det,
        degrees_of_freedom: p * (p - 1) / 2,
        n_observations,
    })
}

/// Residual fit plus KMO and sphericity for a fitted solution.
///
/// KMO and sphericity are optional parts: a singular matrix or an unknown observation
/// count leaves them empty rather than failing the whole report.
pub fn fit_diagnostics(
    corr: &CorrelationMatrix,
    loadings: ArrayView2<f64>,
    factor_correlation: Option<ArrayView2<f64>>,
) -> FactorResult<FitDiagnostics> {
    let residuals = residual_matrix(corr.matrix().view(), loadings, factor_correlation)?;
    let rmsr = root_mean_square_residual(residuals.view());

    let sampling_adequacy = match kaiser_meyer_olkin(corr) {
        Ok(kmo) => Some(kmo),
        Err(e @ (FactorError::SingularMatrix(_) | FactorError::DegenerateInput(_))) => {
            warn!("Skipping sampling adequacy: {}", e);
            None
        }
        Err(e) => return Err(e),
    };
    let sphericity = match corr.n_observations() {
        Some(n) => match bartlett_sphericity(corr, n) {
            Ok(test) => Some(test),
            Err(e @ (FactorError::SingularMatrix(_) | FactorError::InvalidInput(_))) => {
                warn!("Skipping sphericity test: {}", e);
                None
            }
            Err(e) => return Err(e),
        },
        None => None,
    };

    Ok(FitDiagnostics {
        residuals,
        rmsr,
        sampling_adequacy,
        sphericity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::MatrixKind;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn three_variables(n: Option<usize>) -> CorrelationMatrix {
        CorrelationMatrix::from_matrix(
            array![[1.0, 0.5, 0.4], [0.5, 1.0, 0.3], [0.4, 0.3, 1.0]],
            MatrixKind::Correlation,
            n,
        )
        .unwrap()
    }

    #[test]
    fn exact_model_has_zero_residuals() {
        let loadings = array![[0.8, 0.0], [0.7, 0.0], [0.0, 0.6], [0.0, 0.5]];
        let phi = array![[1.0, 0.3], [0.3, 1.0]];
        let mut r = loadings.dot(&phi).dot(&loadings.t());
        r.diag_mut().fill(1.0);
        let residuals = residual_matrix(r.view(), loadings.view(), Some(phi.view())).unwrap();
        assert_abs_diff_eq!(root_mean_square_residual(residuals.view()), 0.0, epsilon = 1e-12);

        // Ignoring the factor correlation leaves the cross-factor pairs unexplained.
        let orthogonal = residual_matrix(r.view(), loadings.view(), None).unwrap();
        assert_abs_diff_eq!(orthogonal[[0, 2]], 0.8 * 0.6 * 0.3, epsilon = 1e-12);
        assert!(root_mean_square_residual(orthogonal.view()) > 0.0);
    }

    #[test]
    fn kmo_matches_reference_values() {
        let kmo = kaiser_meyer_olkin(&three_variables(None)).unwrap();
        assert_abs_diff_eq!(kmo.overall, 0.627861, epsilon = 1e-5);
        assert_abs_diff_eq!(kmo.per_variable[0], 0.593789, epsilon = 1e-5);
        assert_abs_diff_eq!(kmo.per_variable[1], 0.624106, epsilon = 1e-5);
        assert_abs_diff_eq!(kmo.per_variable[2], 0.699402, epsilon = 1e-5);
        assert!(kmo.overall > 0.0 && kmo.overall <= 1.0);
    }

    #[test]
    fn kmo_of_uncorrelated_variables_is_degenerate() {
        let identity = CorrelationMatrix::from_matrix(Array2::eye(3), MatrixKind::Correlation, None).unwrap();
        assert!(matches!(
            kaiser_meyer_olkin(&identity),
            Err(FactorError::DegenerateInput(_))
        ));
    }

    #[test]
    fn sphericity_statistic_for_two_variables() {
        let corr = CorrelationMatrix::from_matrix(array![[1.0, 0.6], [0.6, 1.0]], MatrixKind::Correlation, Some(50))
            .unwrap();
        let test = bartlett_sphericity(&corr, 50).unwrap();
        assert_abs_diff_eq!(test.chi_square, 21.198637, epsilon = 1e-5);
        assert_eq!(test.degrees_of_freedom, 1);
        assert!(bartlett_sphericity(&corr, 2).is_err());
    }

    #[test]
    fn fit_diagnostics_skips_sphericity_without_observation_count() {
        let loadings = array![[0.7], [0.6], [0.5]];
        let without = fit_diagnostics(&three_variables(None), loadings.view(), None).unwrap();
        assert!(without.sphericity.is_none());
        assert!(without.sampling_adequacy.is_some());

        let with = fit_diagnostics(&three_variables(Some(100)), loadings.view(), None).unwrap();
        let sphericity = with.sphericity.unwrap();
        assert_eq!(sphericity.degrees_of_freedom, 3);
        assert!(sphericity.chi_square > 0.0);
        assert_abs_diff_eq!(with.rmsr, without.rmsr, epsilon = 1e-15);
    }

    #[test]
    fn singular_matrix_leaves_adequacy_empty() {
        let corr = CorrelationMatrix::from_matrix(
            array![[1.0, 1.0, 0.3], [1.0, 1.0, 0.3], [0.3, 0.3, 1.0]],
            MatrixKind::Correlation,
            Some(30),
        )
        .unwrap();
        let loadings = array![[0.9], [0.9], [0.3]];
        let report = fit_diagnostics(&corr, loadings.view(), None).unwrap();
        assert!(report.sampling_adequacy.is_none());
        assert!(report.sphericity.is_none());
    }
}
