// src/extraction.rs

//! Factor extraction: reduces a correlation (or covariance) matrix to K latent factors.
//!
//! Two methods are available:
//!
//! * **PCA** takes the top-K eigenpairs of the full matrix in closed form.
//! * **MINRES** iterates on the reduced matrix, whose diagonal holds the current
//!   communality estimates, until the communalities stop moving. This is the iterated
//!   principal-axis route to the minimum-residual solution.
//!
//! In both cases the reported eigenvalues are those of the full input matrix (all P of
//! them), so that variance proportions do not depend on K or on the method.

use crate::communality::{initial_communalities, CommunalityMethod};
use crate::correlation::CorrelationMatrix;
use crate::error::{AnalysisStage, FactorError, FactorResult, FactorWarning};
use crate::linalg_backends::{symmetric_eigen_descending, EighOutput};
use crate::variance::VarianceSummary;
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relative tolerance on negative eigenvalues before a matrix is rejected as not PSD.
const PSD_TOLERANCE: f64 = 1e-8;

pub const DEFAULT_TOLERANCE: f64 = 1e-5;
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionMethod {
    Pca,
    #[default]
    Minres,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Pca => f.write_str("pca"),
            ExtractionMethod::Minres => f.write_str("minres"),
        }
    }
}

impl FromStr for ExtractionMethod {
    type Err = FactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pca" | "principal" => Ok(ExtractionMethod::Pca),
            "minres" | "uls" => Ok(ExtractionMethod::Minres),
            other => Err(FactorError::InvalidInput(format!(
                "Unknown extraction method '{}'; expected 'pca' or 'minres'.",
                other
            ))),
        }
    }
}

/// Configuration for the extraction stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Number of factors to retain (K). Must satisfy 1 <= K <= P.
    pub n_factors: usize,
    pub method: ExtractionMethod,
    /// MINRES stops once the largest absolute communality change is below this value.
    pub tolerance: f64,
    /// MINRES iteration cap. Reaching it yields a `NotConverged` warning, not an error.
    pub max_iterations: usize,
    /// Emit per-iteration diagnostics at debug level.
    pub debug: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            n_factors: 1,
            method: ExtractionMethod::Minres,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            debug: false,
        }
    }
}

/// Unrotated factor solution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub method: ExtractionMethod,
    /// Unrotated loadings. Shape: (n_variables, n_factors)
    pub loadings: Array2<f64>,
    /// All P eigenvalues of the full input matrix, descending.
    pub eigenvalues: Array1<f64>,
    /// Row sums of squared loadings. Shape: (n_variables)
    pub communalities: Array1<f64>,
    /// Variable variance minus communality (1 - communality for a correlation matrix).
    pub uniquenesses: Array1<f64>,
    /// Eigenvalue-based explained and cumulative proportions for the K retained factors.
    pub variance: VarianceSummary,
    /// Source of the MINRES starting communalities; `None` for PCA.
    pub communality_method: Option<CommunalityMethod>,
    pub iterations: usize,
    pub converged: bool,
    pub warnings: Vec<FactorWarning>,
}

impl ExtractionResult {
    pub fn n_variables(&self) -> usize {
        self.loadings.nrows()
    }

    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    /// Eigenvalue-based proportions for all P components; they sum to 1.
    pub fn full_variance(&self) -> FactorResult<VarianceSummary> {
        VarianceSummary::from_eigenvalues(self.eigenvalues.view(), self.variance.total_variance)
    }

    /// Sum-of-squared-loadings variant of the variance summary. This is a different
    /// metric from `variance` (it counts only common variance) and is labeled as such.
    pub fn loadings_variance(&self) -> FactorResult<VarianceSummary> {
        VarianceSummary::from_loadings(self.loadings.view(), None, self.variance.total_variance)
    }
}

/// Loadings from the leading `k` eigenpairs; each column is `v_j * sqrt(lambda_j)`.
/// Non-positive eigenvalues contribute a zero column. Columns are sign-normalized so
/// their sum is non-negative.
fn loadings_from_eigenpairs(decomposition: &EighOutput<f64>, k: usize) -> Array2<f64> {
    let mut loadings = decomposition.eigenvectors.slice(s![.., ..k]).to_owned();
    for (j, mut column) in loadings.axis_iter_mut(Axis(1)).enumerate() {
        let scale = decomposition.eigenvalues[j].max(0.0).sqrt();
        column.mapv_inplace(|v| v * scale);
        if column.sum() < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
    loadings
}

fn row_sums_of_squares(loadings: &Array2<f64>) -> Array1<f64> {
    loadings.map_axis(Axis(1), |row| row.dot(&row))
}

/// Sum of squared off-diagonal residuals `R - L L^T`; the MINRES objective.
pub fn off_diagonal_residual_ss(matrix: ArrayView2<f64>, loadings: ArrayView2<f64>) -> f64 {
    let implied = loadings.dot(&loadings.t());
    let n = matrix.nrows();
    let mut total = 0.0;
    for i in 0..n {
        for j in 0..n {
            if i != j {
                total += (matrix[[i, j]] - implied[[i, j]]).powi(2);
            }
        }
    }
    total
}

/// Extracts `config.n_factors` unrotated factors from `corr`.
///
/// # Errors
/// * `InvalidInput` if K is 0 or larger than P, or the tolerance is not positive.
/// * `NotPositiveSemidefinite` if the input matrix has an eigenvalue below
///   `-1e-8 * max(1, trace)`. Such matrices are reported, never clamped.
/// * Errors from the communality estimator other than the singular fallback.
pub fn extract(corr: &CorrelationMatrix, config: &ExtractionConfig) -> FactorResult<ExtractionResult> {
    let n_variables = corr.n_variables();
    let k = config.n_factors;
    if k == 0 || k > n_variables {
        return Err(FactorError::InvalidInput(format!(
            "Number of factors must be between 1 and {} (number of variables), got {}.",
            n_variables, k
        )));
    }
    if !(config.tolerance.is_finite() && config.tolerance > 0.0) {
        return Err(FactorError::InvalidInput(format!(
            "Extraction tolerance must be positive, got {}.",
            config.tolerance
        )));
    }

    info!(
        "Extracting {} factor(s) from {} variables using {}.",
        k, n_variables, config.method
    );
    let start_time = std::time::Instant::now();

    let total_variance = corr.total_variance();
    let full = symmetric_eigen_descending(corr.matrix())?;
    let min_eigenvalue = full.eigenvalues[n_variables - 1];
    if min_eigenvalue < -PSD_TOLERANCE * total_variance.max(1.0) {
        return Err(FactorError::NotPositiveSemidefinite { min_eigenvalue });
    }
    let variance = VarianceSummary::from_eigenvalues(full.eigenvalues.view(), total_variance)?.truncated(k);

    let mut result = match config.method {
        ExtractionMethod::Pca => {
            let loadings = loadings_from_eigenpairs(&full, k);
            let communalities = row_sums_of_squares(&loadings);
            ExtractionResult {
                method: ExtractionMethod::Pca,
                uniquenesses: corr.variances() - &communalities,
                loadings,
                eigenvalues: full.eigenvalues,
                communalities,
                variance,
                communality_method: None,
                iterations: 0,
                converged: true,
                warnings: Vec::new(),
            }
        }
        ExtractionMethod::Minres => minres(corr, config, full.eigenvalues, variance)?,
    };

    let variances = corr.variances();
    let heywood: Vec<usize> = (0..n_variables)
        .filter(|&i| result.communalities[i] > variances[i])
        .collect();
    if !heywood.is_empty() {
        warn!("Heywood case: communalities exceed total variance for variables {:?}.", heywood);
        result.warnings.push(FactorWarning::HeywoodCase { variables: heywood });
    }

    info!(
        "Extraction finished in {:?} after {} iteration(s) (converged: {}).",
        start_time.elapsed(),
        result.iterations,
        result.converged
    );
    Ok(result)
}

fn minres(
    corr: &CorrelationMatrix,
    config: &ExtractionConfig,
    eigenvalues: Array1<f64>,
    variance: VarianceSummary,
) -> FactorResult<ExtractionResult> {
    let matrix = corr.matrix();
    let k = config.n_factors;
    let mut warnings = Vec::new();

    let estimate = initial_communalities(corr)?;
    if !estimate.is_exact() {
        warnings.push(FactorWarning::ApproximateCommunalities);
    }
    let communality_method = estimate.method;
    let mut communalities = estimate.values;
    if config.debug {
        debug!("MINRES starting communalities ({:?}): {:.5}", communality_method, communalities);
    }

    let mut reduced = matrix.clone();
    let mut best: Option<(f64, Array2<f64>, Array1<f64>)> = None;
    let mut last_change = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;
        reduced.diag_mut().assign(&communalities);
        let decomposition = symmetric_eigen_descending(&reduced)?;
        let loadings = loadings_from_eigenpairs(&decomposition, k);
        let updated = row_sums_of_squares(&loadings);

        last_change = updated
            .iter()
            .zip(communalities.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        communalities = updated;

        let residual = off_diagonal_residual_ss(matrix.view(), loadings.view());
        if config.debug {
            debug!(
                "MINRES iteration {}: max communality change {:.3e}, residual SS {:.6e}",
                iterations, last_change, residual
            );
        }

        if last_change < config.tolerance {
            converged = true;
            best = Some((residual, loadings, communalities.clone()));
            break;
        }
        let improves = best.as_ref().map_or(true, |(r, _, _)| residual < *r);
        if improves {
            best = Some((residual, loadings, communalities.clone()));
        }
    }

    let (loadings, communalities) = match best {
        Some((_, loadings, communalities)) => (loadings, communalities),
        None => {
            return Err(FactorError::InvalidInput(
                "MINRES needs at least one iteration; max_iterations is 0.".to_string(),
            ))
        }
    };

    if !converged {
        warn!(
            "MINRES did not converge within {} iterations (last change {:.3e}); returning best iterate.",
            config.max_iterations, last_change
        );
        warnings.push(FactorWarning::NotConverged {
            stage: AnalysisStage::Extraction,
            iterations,
            last_change,
        });
    }

    Ok(ExtractionResult {
        method: ExtractionMethod::Minres,
        uniquenesses: corr.variances() - &communalities,
        loadings,
        eigenvalues,
        communalities,
        variance,
        communality_method: Some(communality_method),
        iterations,
        converged,
        warnings,
    })
}
