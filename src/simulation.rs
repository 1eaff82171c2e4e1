// src/simulation.rs

//! Seeded sampling from a known common-factor model, `x = L f + e`.
//!
//! Factors are drawn from `N(0, Phi)` (independent standard normals when no factor
//! correlation is given) and each variable receives independent noise with variance
//! `1 - h_i`, so every simulated variable has unit population variance.

use crate::error::{FactorError, FactorResult};
use crate::linalg_backends::cholesky_lower;
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Draws `n_observations` rows from the factor model with the given loadings.
///
/// * `loadings` - Population pattern loadings, shape (n_variables, n_factors).
/// * `factor_correlation` - Optional K×K factor correlation; must be positive definite.
/// * `seed` - Seed for `ChaCha8Rng`; equal seeds give identical samples.
///
/// # Errors
/// `InvalidInput` when the shapes disagree, a communality exceeds 1, or the factor
/// correlation is not positive definite.
pub fn sample_observations(
    loadings: ArrayView2<f64>,
    factor_correlation: Option<ArrayView2<f64>>,
    n_observations: usize,
    seed: u64,
) -> FactorResult<Array2<f64>> {
    let (n_variables, n_factors) = loadings.dim();
    if n_variables == 0 || n_factors == 0 || n_observations == 0 {
        return Err(FactorError::InvalidInput(format!(
            "Cannot simulate {} observations of {} variables on {} factors.",
            n_observations, n_variables, n_factors
        )));
    }

    let factor_chol: Option<Array2<f64>> = match factor_correlation {
        Some(phi) => {
            if phi.dim() != (n_factors, n_factors) {
                return Err(FactorError::InvalidInput(format!(
                    "Factor correlation shape {:?} does not match {} factors.",
                    phi.dim(),
                    n_factors
                )));
            }
            Some(cholesky_lower(
                &phi.to_owned(),
                "factor correlation must be positive definite",
            )?)
        }
        None => None,
    };

    let communalities: Array1<f64> = match factor_correlation {
        Some(phi) => (&loadings.dot(&phi) * &loadings).sum_axis(Axis(1)),
        None => loadings.map_axis(Axis(1), |row| row.dot(&row)),
    };
    if let Some(i) = communalities.iter().position(|&h| !(0.0..=1.0).contains(&h)) {
        return Err(FactorError::InvalidInput(format!(
            "Variable {} has communality {:.4}, outside [0, 1].",
            i, communalities[i]
        )));
    }
    let noise_sd = communalities.mapv(|h| (1.0 - h).sqrt());

    info!(
        "Simulating {} observations of {} variables from {} factor(s) (seed {}).",
        n_observations, n_variables, n_factors, seed
    );

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| FactorError::InvalidInput(format!("Failed to create normal distribution: {}", e)))?;

    let mut factors = Array2::from_shape_fn((n_observations, n_factors), |_| normal.sample(&mut rng));
    if let Some(chol) = factor_chol {
        factors = factors.dot(&chol.t());
    }
    let noise = Array2::from_shape_fn((n_observations, n_variables), |_| normal.sample(&mut rng));

    Ok(factors.dot(&loadings.t()) + &(noise * &noise_sd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn equal_seeds_give_equal_samples() {
        let loadings = array![[0.8], [0.6], [0.7]];
        let a = sample_observations(loadings.view(), None, 50, 3).unwrap();
        let b = sample_observations(loadings.view(), None, 50, 3).unwrap();
        let c = sample_observations(loadings.view(), None, 50, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.dim(), (50, 3));
    }

    #[test]
    fn sample_correlation_approaches_the_model() {
        let loadings = array![[0.8, 0.0], [0.7, 0.0], [0.0, 0.8], [0.0, 0.7]];
        let phi = array![[1.0, 0.5], [0.5, 1.0]];
        let data = sample_observations(loadings.view(), Some(phi.view()), 20_000, 9).unwrap();
        let corr = crate::correlation::CorrelationMatrix::from_observations(
            data.view(),
            crate::correlation::MatrixKind::Correlation,
        )
        .unwrap();
        let implied = loadings.dot(&phi).dot(&loadings.t());
        // Sampling error of a correlation at n = 20000 is below 0.01.
        assert!((corr.matrix()[[0, 1]] - implied[[0, 1]]).abs() < 0.03);
        assert!((corr.matrix()[[0, 2]] - implied[[0, 2]]).abs() < 0.03);
        assert!((corr.matrix()[[1, 3]] - implied[[1, 3]]).abs() < 0.03);
    }

    #[test]
    fn rejects_communality_above_one() {
        let loadings = array![[0.9, 0.6], [0.5, 0.5]];
        assert!(matches!(
            sample_observations(loadings.view(), None, 10, 1),
            Err(FactorError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_indefinite_factor_correlation() {
        let loadings = array![[0.5, 0.2], [0.4, 0.3]];
        let phi = array![[1.0, 1.5], [1.5, 1.0]];
        assert!(sample_observations(loadings.view(), Some(phi.view()), 10, 1).is_err());
    }
}
