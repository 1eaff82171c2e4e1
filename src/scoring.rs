// src/scoring.rs

//! Factor scores: per-observation estimates of the latent factors.
//!
//! Every method reduces to a P×K weight matrix `W` applied to the prepared observations
//! (`scores = Z · W`), so a fitted model can store `W` and score new data later. Scores
//! are only defined up to the method's own scaling and should be compared through their
//! covariance structure, not their raw values.

use crate::correlation::CorrelationMatrix;
use crate::error::{FactorError, FactorResult};
use crate::linalg_backends::{symmetric_inverse, symmetric_inverse_sqrt};
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Uniquenesses at or below this value make the Bartlett and Anderson-Rubin weights undefined.
const MIN_UNIQUENESS: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringMethod {
    /// Thurstone's regression estimator, `W = R^-1 S`.
    #[default]
    Regression,
    /// Weighted least squares, conditionally unbiased: `W = Psi^-1 L (L^T Psi^-1 L)^-1`.
    Bartlett,
    /// Uncorrelated unit-variance scores: `W = Psi^-1 L (L^T Psi^-1 R Psi^-1 L)^(-1/2)`.
    AndersonRubin,
}

impl fmt::Display for ScoringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringMethod::Regression => f.write_str("regression"),
            ScoringMethod::Bartlett => f.write_str("bartlett"),
            ScoringMethod::AndersonRubin => f.write_str("anderson_rubin"),
        }
    }
}

impl FromStr for ScoringMethod {
    type Err = FactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regression" | "thurstone" => Ok(ScoringMethod::Regression),
            "bartlett" => Ok(ScoringMethod::Bartlett),
            "anderson_rubin" | "anderson-rubin" | "andersonrubin" => Ok(ScoringMethod::AndersonRubin),
            other => Err(FactorError::InvalidInput(format!(
                "Unknown scoring method '{}'; expected regression, bartlett or anderson_rubin.",
                other
            ))),
        }
    }
}

/// Borrowed view of a fitted solution, enough to derive score weights.
#[derive(Clone, Copy, Debug)]
pub struct ScoringInputs<'a> {
    /// Pattern loadings, shape (n_variables, n_factors).
    pub loadings: ArrayView2<'a, f64>,
    /// Structure matrix of an oblique solution.
    pub structure: Option<ArrayView2<'a, f64>>,
    pub factor_correlation: Option<ArrayView2<'a, f64>>,
    pub correlation: &'a CorrelationMatrix,
    pub uniquenesses: ArrayView1<'a, f64>,
}

impl<'a> ScoringInputs<'a> {
    fn validate(&self) -> FactorResult<()> {
        let p = self.correlation.n_variables();
        let (rows, k) = self.loadings.dim();
        if rows != p || k == 0 {
            return Err(FactorError::InvalidInput(format!(
                "Loadings of shape {:?} do not match {} variables.",
                self.loadings.dim(),
                p
            )));
        }
        if self.uniquenesses.len() != p {
            return Err(FactorError::InvalidInput(format!(
                "Expected {} uniquenesses, got {}.",
                p,
                self.uniquenesses.len()
            )));
        }
        if let Some(structure) = self.structure {
            if structure.dim() != self.loadings.dim() {
                return Err(FactorError::InvalidInput(format!(
                    "Structure shape {:?} does not match loadings shape {:?}.",
                    structure.dim(),
                    self.loadings.dim()
                )));
            }
        }
        if let Some(phi) = self.factor_correlation {
            if phi.dim() != (k, k) {
                return Err(FactorError::InvalidInput(format!(
                    "Factor correlation shape {:?} does not match {} factors.",
                    phi.dim(),
                    k
                )));
            }
        }
        Ok(())
    }

    /// Structure matrix: given, or `L Phi` for an oblique solution, or `L` itself.
    fn structure_matrix(&self) -> Array2<f64> {
        match (self.structure, self.factor_correlation) {
            (Some(structure), _) => structure.to_owned(),
            (None, Some(phi)) => self.loadings.dot(&phi),
            (None, None) => self.loadings.to_owned(),
        }
    }

    /// `Psi^-1 L`, failing when a uniqueness is not strictly positive.
    fn inverse_uniqueness_weighted_loadings(&self) -> FactorResult<Array2<f64>> {
        if let Some(i) = self.uniquenesses.iter().position(|&u| !(u > MIN_UNIQUENESS)) {
            return Err(FactorError::SingularMatrix(format!(
                "uniqueness of variable {} is {:.3e}; the uniqueness matrix cannot be inverted",
                i, self.uniquenesses[i]
            )));
        }
        let inv_psi = self.uniquenesses.mapv(|u| 1.0 / u).insert_axis(Axis(1));
        Ok(&self.loadings * &inv_psi)
    }
}

/// Factor scores together with the weights that produced them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreMatrix {
    /// Shape: (n_observations, n_factors)
    pub scores: Array2<f64>,
    /// Shape: (n_variables, n_factors)
    pub weights: Array2<f64>,
    pub method: ScoringMethod,
}

/// Computes the P×K score weight matrix for `method`.
///
/// # Errors
/// `SingularMatrix` when a required inverse does not exist, including a non-positive
/// uniqueness for Bartlett or Anderson-Rubin; `InvalidInput` on shape mismatches.
pub fn score_weights(inputs: &ScoringInputs<'_>, method: ScoringMethod) -> FactorResult<Array2<f64>> {
    inputs.validate()?;
    let r = inputs.correlation.matrix();
    let weights = match method {
        ScoringMethod::Regression => {
            let r_inverse = symmetric_inverse(r, "regression scores need an invertible input matrix")?;
            r_inverse.dot(&inputs.structure_matrix())
        }
        ScoringMethod::Bartlett => {
            let weighted = inputs.inverse_uniqueness_weighted_loadings()?;
            let information = inputs.loadings.t().dot(&weighted);
            let information_inverse =
                symmetric_inverse(&information, "Bartlett scores need L^T Psi^-1 L to be invertible")?;
            weighted.dot(&information_inverse)
        }
        ScoringMethod::AndersonRubin => {
            let weighted = inputs.inverse_uniqueness_weighted_loadings()?;
            let middle = weighted.t().dot(r).dot(&weighted);
            let middle_inverse_sqrt = symmetric_inverse_sqrt(
                &middle,
                "Anderson-Rubin scores need L^T Psi^-1 R Psi^-1 L to be positive definite",
            )?;
            weighted.dot(&middle_inverse_sqrt)
        }
    };
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(FactorError::SingularMatrix(format!(
            "{} score weights are not finite",
            method
        )));
    }
    Ok(weights)
}

/// Scores prepared observations `z` (standardized for a correlation analysis, centered
/// for a covariance analysis), shape (n_observations, n_variables).
pub fn compute_scores(
    z: ArrayView2<f64>,
    inputs: &ScoringInputs<'_>,
    method: ScoringMethod,
) -> FactorResult<ScoreMatrix> {
    let p = inputs.correlation.n_variables();
    if z.ncols() != p {
        return Err(FactorError::InvalidInput(format!(
            "Observations have {} columns but the model has {} variables.",
            z.ncols(),
            p
        )));
    }
    if z.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::InvalidInput(
            "Observations to score contain non-finite values.".to_string(),
        ));
    }

    info!(
        "Computing {} factor scores for {} observations.",
        method,
        z.nrows()
    );
    let weights = score_weights(inputs, method)?;
    debug!("{} score weights:\n{:.5}", method, weights);
    let scores = z.dot(&weights);
    Ok(ScoreMatrix {
        scores,
        weights,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{standardize, MatrixKind};
    use crate::simulation::sample_observations;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    fn population_loadings() -> Array2<f64> {
        array![
            [0.8, 0.1],
            [0.7, 0.2],
            [0.75, 0.0],
            [0.1, 0.8],
            [0.2, 0.6],
            [0.0, 0.7]
        ]
    }

    fn sample_covariance(scores: &Array2<f64>) -> Array2<f64> {
        let n = scores.nrows() as f64;
        let means = scores.mean_axis(Axis(0)).unwrap();
        let centered = scores - &means;
        centered.t().dot(&centered) / (n - 1.0)
    }

    #[test]
    fn anderson_rubin_scores_are_uncorrelated_with_unit_variance() {
        let data = sample_observations(population_loadings().view(), None, 300, 11).unwrap();
        let (z, _) = standardize(data.view()).unwrap();
        let corr = CorrelationMatrix::from_observations(data.view(), MatrixKind::Correlation).unwrap();
        let loadings = population_loadings();
        let uniquenesses: Array1<f64> = 1.0 - &loadings.map_axis(Axis(1), |r| r.dot(&r));
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: None,
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        let result = compute_scores(z.view(), &inputs, ScoringMethod::AndersonRubin).unwrap();
        assert_eq!(result.scores.dim(), (300, 2));
        let cov = sample_covariance(&result.scores);
        assert_abs_diff_eq!(cov[[0, 0]], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(cov[[1, 1]], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(cov[[0, 1]], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn bartlett_weights_are_conditionally_unbiased() {
        let loadings = population_loadings();
        let mut r = loadings.dot(&loadings.t());
        r.diag_mut().fill(1.0);
        let corr = CorrelationMatrix::from_matrix(r, MatrixKind::Correlation, None).unwrap();
        let uniquenesses: Array1<f64> = 1.0 - &loadings.map_axis(Axis(1), |r| r.dot(&r));
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: None,
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        let weights = score_weights(&inputs, ScoringMethod::Bartlett).unwrap();
        let product = weights.t().dot(&loadings);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn regression_uses_structure_for_oblique_solutions() {
        let loadings = array![[0.8, 0.0], [0.7, 0.0], [0.0, 0.6], [0.0, 0.5]];
        let phi = array![[1.0, 0.4], [0.4, 1.0]];
        let mut r = loadings.dot(&phi).dot(&loadings.t());
        r.diag_mut().fill(1.0);
        let corr = CorrelationMatrix::from_matrix(r.clone(), MatrixKind::Correlation, None).unwrap();
        let uniquenesses = array![0.36, 0.51, 0.64, 0.75];
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: Some(phi.view()),
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        let weights = score_weights(&inputs, ScoringMethod::Regression).unwrap();
        // R W reproduces the structure matrix L Phi.
        let reproduced = r.dot(&weights);
        let structure = loadings.dot(&phi);
        for (a, b) in reproduced.iter().zip(structure.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_uniqueness_is_singular_for_bartlett_and_anderson_rubin() {
        let loadings = population_loadings();
        let mut r = loadings.dot(&loadings.t());
        r.diag_mut().fill(1.0);
        let corr = CorrelationMatrix::from_matrix(r, MatrixKind::Correlation, None).unwrap();
        let uniquenesses = array![0.0, 0.47, 0.4375, 0.35, 0.6, 0.51];
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: None,
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        for method in [ScoringMethod::Bartlett, ScoringMethod::AndersonRubin] {
            assert!(matches!(
                score_weights(&inputs, method),
                Err(FactorError::SingularMatrix(_))
            ));
        }
        assert!(score_weights(&inputs, ScoringMethod::Regression).is_ok());
    }

    #[test]
    fn regression_fails_on_singular_correlation() {
        let r = array![[1.0, 1.0, 0.3], [1.0, 1.0, 0.3], [0.3, 0.3, 1.0]];
        let corr = CorrelationMatrix::from_matrix(r, MatrixKind::Correlation, None).unwrap();
        let loadings = array![[0.9], [0.9], [0.3]];
        let uniquenesses = array![0.19, 0.19, 0.91];
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: None,
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        assert!(matches!(
            score_weights(&inputs, ScoringMethod::Regression),
            Err(FactorError::SingularMatrix(_))
        ));
    }

    #[test]
    fn observation_width_must_match() {
        let loadings = population_loadings();
        let mut r = loadings.dot(&loadings.t());
        r.diag_mut().fill(1.0);
        let corr = CorrelationMatrix::from_matrix(r, MatrixKind::Correlation, None).unwrap();
        let uniquenesses: Array1<f64> = 1.0 - &loadings.map_axis(Axis(1), |r| r.dot(&r));
        let inputs = ScoringInputs {
            loadings: loadings.view(),
            structure: None,
            factor_correlation: None,
            correlation: &corr,
            uniquenesses: uniquenesses.view(),
        };
        let z = Array2::<f64>::zeros((4, 5));
        assert!(matches!(
            compute_scores(z.view(), &inputs, ScoringMethod::Regression),
            Err(FactorError::InvalidInput(_))
        ));
    }

    #[test]
    fn scoring_method_names_round_trip() {
        for method in [ScoringMethod::Regression, ScoringMethod::Bartlett, ScoringMethod::AndersonRubin] {
            assert_eq!(method.to_string().parse::<ScoringMethod>().unwrap(), method);
        }
        assert_eq!("Anderson-Rubin".parse::<ScoringMethod>().unwrap(), ScoringMethod::AndersonRubin);
        assert!("ml".parse::<ScoringMethod>().is_err());
    }
}
