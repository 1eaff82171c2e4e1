// src/communality.rs

use crate::correlation::CorrelationMatrix;
use crate::error::{FactorError, FactorResult};
use crate::linalg_backends::symmetric_inverse;
use log::warn;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// How an initial communality vector was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommunalityMethod {
    /// Exact squared multiple correlation from the inverse of the input matrix.
    SquaredMultipleCorrelation,
    /// Degraded estimate: largest absolute off-diagonal correlation of each variable.
    MaxAbsoluteCorrelation,
}

/// Initial communalities used to seed iterative extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommunalityEstimate {
    pub values: Array1<f64>,
    pub method: CommunalityMethod,
}

impl CommunalityEstimate {
    /// True when the values come from an exact inverse rather than the fallback.
    pub fn is_exact(&self) -> bool {
        self.method == CommunalityMethod::SquaredMultipleCorrelation
    }
}

/// Squared multiple correlation of each variable with all others:
/// `h_i = d_i - 1 / (R^-1)_ii`, where `d_i` is the variable's variance (1 for a
/// correlation matrix).
///
/// # Errors
/// `SingularMatrix` when the matrix cannot be inverted, e.g. perfectly collinear variables.
pub fn squared_multiple_correlations(corr: &CorrelationMatrix) -> FactorResult<Array1<f64>> {
    let inverse = symmetric_inverse(
        corr.matrix(),
        "squared multiple correlations need an invertible input matrix",
    )?;
    let variances = corr.variances();
    let values: Array1<f64> = variances
        .iter()
        .zip(inverse.diag().iter())
        .map(|(&d, &inv_ii)| d - 1.0 / inv_ii)
        .collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::SingularMatrix(
            "squared multiple correlations are not finite".to_string(),
        ));
    }
    Ok(values)
}

/// Largest absolute off-diagonal correlation per variable, rescaled to the variable's
/// variance in covariance mode.
pub fn max_absolute_correlations(corr: &CorrelationMatrix) -> Array1<f64> {
    let standardized = corr.to_correlation();
    let r = standardized.matrix();
    let variances = corr.variances();
    (0..corr.n_variables())
        .map(|i| {
            let max_abs = r
                .row(i)
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, v)| v.abs())
                .fold(0.0_f64, f64::max);
            max_abs * variances[i]
        })
        .collect()
}

/// Initial communalities: the exact squared multiple correlations when the matrix is
/// invertible, otherwise the max-absolute-correlation fallback flagged as such.
///
/// Only `SingularMatrix` triggers the fallback; backend failures propagate.
pub fn initial_communalities(corr: &CorrelationMatrix) -> FactorResult<CommunalityEstimate> {
    match squared_multiple_correlations(corr) {
        Ok(values) => Ok(CommunalityEstimate {
            values,
            method: CommunalityMethod::SquaredMultipleCorrelation,
        }),
        Err(FactorError::SingularMatrix(reason)) => {
            warn!(
                "Exact communality estimate unavailable ({}); falling back to maximum absolute correlations.",
                reason
            );
            Ok(CommunalityEstimate {
                values: max_absolute_correlations(corr),
                method: CommunalityMethod::MaxAbsoluteCorrelation,
            })
        }
        Err(other) => Err(other),
    }
}
