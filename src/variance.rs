// src/variance.rs

use crate::error::{FactorError, FactorResult};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Variance accounted for by each factor.
///
/// `proportion` is always a true proportion: `variance / total_variance`, where the
/// total is P for a correlation matrix and the trace for a covariance matrix. Over all
/// P eigenvalues the proportions sum to 1. The unnormalized amounts are kept in
/// `variance` and are a different metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarianceSummary {
    /// Raw variance per factor (eigenvalue or sum of squared loadings).
    pub variance: Array1<f64>,
    /// `variance / total_variance`.
    pub proportion: Array1<f64>,
    /// Running sum of `proportion`.
    pub cumulative: Array1<f64>,
    pub total_variance: f64,
}

impl VarianceSummary {
    fn build(variance: Array1<f64>, total_variance: f64) -> FactorResult<Self> {
        if !(total_variance.is_finite() && total_variance > 0.0) {
            return Err(FactorError::InvalidInput(format!(
                "Total variance must be positive and finite, got {}.",
                total_variance
            )));
        }
        let proportion = variance.mapv(|v| v / total_variance);
        let mut running = 0.0;
        let cumulative = proportion.mapv(|p| {
            running += p;
            running
        });
        Ok(Self {
            variance,
            proportion,
            cumulative,
            total_variance,
        })
    }

    /// Summary from eigenvalues of the input matrix.
    pub fn from_eigenvalues(eigenvalues: ArrayView1<f64>, total_variance: f64) -> FactorResult<Self> {
        Self::build(eigenvalues.to_owned(), total_variance)
    }

    /// Summary from per-factor variances already computed by the caller.
    pub fn from_factor_variances(variances: ArrayView1<f64>, total_variance: f64) -> FactorResult<Self> {
        Self::build(variances.to_owned(), total_variance)
    }

    /// Summary from a loading (pattern) matrix: factor k accounts for
    /// `diag(Phi P^T P)_k`, which reduces to the column sum of squared loadings when the
    /// factors are uncorrelated. The contributions add up to the total communality.
    pub fn from_loadings(
        loadings: ArrayView2<f64>,
        factor_correlation: Option<ArrayView2<f64>>,
        total_variance: f64,
    ) -> FactorResult<Self> {
        let cross = loadings.t().dot(&loadings);
        let variances: Array1<f64> = match factor_correlation {
            Some(phi) => {
                if phi.dim() != cross.dim() {
                    return Err(FactorError::InvalidInput(format!(
                        "Factor correlation shape {:?} does not match {} factors.",
                        phi.dim(),
                        loadings.ncols()
                    )));
                }
                phi.dot(&cross).diag().to_owned()
            }
            None => cross.diag().to_owned(),
        };
        Self::build(variances, total_variance)
    }

    pub fn n_factors(&self) -> usize {
        self.variance.len()
    }

    /// Keeps the first `k` factors. Cumulative values are unchanged by truncation.
    pub fn truncated(&self, k: usize) -> Self {
        let k = k.min(self.n_factors());
        Self {
            variance: self.variance.slice(ndarray::s![..k]).to_owned(),
            proportion: self.proportion.slice(ndarray::s![..k]).to_owned(),
            cumulative: self.cumulative.slice(ndarray::s![..k]).to_owned(),
            total_variance: self.total_variance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigenvalue_proportions_sum_to_one() {
        let eig = array![2.5, 1.0, 0.3, 0.2];
        let summary = VarianceSummary::from_eigenvalues(eig.view(), 4.0).unwrap();
        assert_abs_diff_eq!(summary.proportion[0], 0.625, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.proportion.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.cumulative[3], 1.0, epsilon = 1e-12);
        for &p in summary.proportion.iter() {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn truncation_keeps_cumulative_values() {
        let eig = array![2.5, 1.0, 0.3, 0.2];
        let summary = VarianceSummary::from_eigenvalues(eig.view(), 4.0).unwrap().truncated(2);
        assert_eq!(summary.n_factors(), 2);
        assert_abs_diff_eq!(summary.cumulative[1], 0.875, epsilon = 1e-12);
    }

    #[test]
    fn loadings_summary_with_and_without_factor_correlation() {
        let loadings = array![[0.8, 0.0], [0.7, 0.1], [0.0, 0.9]];
        let orthogonal = VarianceSummary::from_loadings(loadings.view(), None, 3.0).unwrap();
        assert_abs_diff_eq!(orthogonal.variance[0], 0.64 + 0.49, epsilon = 1e-12);
        assert_abs_diff_eq!(orthogonal.variance[1], 0.01 + 0.81, epsilon = 1e-12);

        let phi = array![[1.0, 0.5], [0.5, 1.0]];
        let oblique = VarianceSummary::from_loadings(loadings.view(), Some(phi.view()), 3.0).unwrap();
        // Contributions add up to the total communality diag(P Phi P^T).
        let communality_total: f64 = loadings.dot(&phi).dot(&loadings.t()).diag().sum();
        assert_abs_diff_eq!(oblique.variance.sum(), communality_total, epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_positive_total() {
        let eig = array![1.0];
        assert!(VarianceSummary::from_eigenvalues(eig.view(), 0.0).is_err());
    }
}
