// src/correlation.rs

//! Builds the P×P correlation or covariance matrix that every later stage consumes.

use crate::error::{FactorError, FactorResult};
use float_cmp::approx_eq;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Absolute tolerance for symmetry and unit-diagonal checks on supplied matrices.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Whether the analysis runs on the correlation or the covariance of the variables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatrixKind {
    #[default]
    Correlation,
    Covariance,
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixKind::Correlation => f.write_str("correlation"),
            MatrixKind::Covariance => f.write_str("covariance"),
        }
    }
}

impl FromStr for MatrixKind {
    type Err = FactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correlation" | "cor" => Ok(MatrixKind::Correlation),
            "covariance" | "cov" => Ok(MatrixKind::Covariance),
            other => Err(FactorError::InvalidInput(format!(
                "Unknown matrix kind '{}'; expected 'correlation' or 'covariance'.",
                other
            ))),
        }
    }
}

/// Per-column mean and sample standard deviation (N-1 denominator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub means: Array1<f64>,
    pub std_devs: Array1<f64>,
}

/// A validated, exactly symmetric P×P correlation or covariance matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    matrix: Array2<f64>,
    kind: MatrixKind,
    /// Number of observations the matrix was estimated from, when known.
    n_observations: Option<usize>,
}

/// Validates the observation matrix and computes column means and standard deviations.
///
/// Fails when there are fewer than 2 observations or 2 variables, when any value is
/// non-finite, or when a column is constant.
pub fn column_statistics(data: ArrayView2<f64>) -> FactorResult<ColumnStatistics> {
    let (n_samples, n_features) = data.dim();
    if n_samples < 2 {
        return Err(FactorError::InvalidInput(format!(
            "Observation matrix must have at least 2 rows, got {}.",
            n_samples
        )));
    }
    if n_features < 2 {
        return Err(FactorError::InvalidInput(format!(
            "Observation matrix must have at least 2 columns, got {}.",
            n_features
        )));
    }
    if let Some(((row, col), value)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(FactorError::InvalidInput(format!(
            "Observation matrix contains a non-finite value ({}) at row {}, column {}.",
            value, row, col
        )));
    }

    let stats: Vec<(f64, f64, f64)> = data
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| {
            let mean = column.sum() / n_samples as f64;
            let sum_sq_deviations: f64 = column.iter().map(|&x| (x - mean).powi(2)).sum();
            let std_dev = (sum_sq_deviations / (n_samples as f64 - 1.0)).sqrt();
            let max_abs = column.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()));
            (mean, std_dev, max_abs)
        })
        .collect();

    // Relative to the column's own magnitude, so rescaling never changes the verdict.
    for (col, &(_, std_dev, max_abs)) in stats.iter().enumerate() {
        if std_dev == 0.0 || std_dev <= 1e-12 * max_abs {
            return Err(FactorError::InvalidInput(format!(
                "Column {} has zero variance; its correlation is undefined.",
                col
            )));
        }
    }

    Ok(ColumnStatistics {
        means: stats.iter().map(|&(m, _, _)| m).collect(),
        std_devs: stats.iter().map(|&(_, s, _)| s).collect(),
    })
}

/// Returns the z-scored observations (column mean 0, sample variance 1) and the
/// statistics used, so that `Z^T Z / (N-1)` equals the Pearson correlation matrix.
pub fn standardize(data: ArrayView2<f64>) -> FactorResult<(Array2<f64>, ColumnStatistics)> {
    let stats = column_statistics(data)?;
    let mut standardized = data.to_owned();
    standardized -= &stats.means;
    standardized /= &stats.std_devs;
    Ok((standardized, stats))
}

/// Subtracts column means only; the scoring input for covariance-mode analyses.
pub fn center(data: ArrayView2<f64>) -> FactorResult<(Array2<f64>, ColumnStatistics)> {
    let stats = column_statistics(data)?;
    let mut centered = data.to_owned();
    centered -= &stats.means;
    Ok((centered, stats))
}

/// Standardizes (correlation) or centers (covariance) the observations in one pass.
pub fn prepare_observations(
    data: ArrayView2<f64>,
    kind: MatrixKind,
) -> FactorResult<(Array2<f64>, ColumnStatistics)> {
    match kind {
        MatrixKind::Correlation => standardize(data),
        MatrixKind::Covariance => center(data),
    }
}

fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

impl CorrelationMatrix {
    /// Computes the Pearson correlation (or N-1 sample covariance) matrix of `data`,
    /// shape (n_observations, n_variables).
    ///
    /// # Errors
    /// Returns `InvalidInput` if there are fewer than 2 observations or variables,
    /// a value is non-finite, or a column has zero variance.
    pub fn from_observations(data: ArrayView2<f64>, kind: MatrixKind) -> FactorResult<Self> {
        let (prepared, _) = prepare_observations(data, kind)?;
        Ok(Self::from_prepared(prepared.view(), kind))
    }

    /// Builds the matrix from observations already passed through
    /// [`prepare_observations`] with the same `kind`.
    pub(crate) fn from_prepared(prepared: ArrayView2<f64>, kind: MatrixKind) -> Self {
        let (n_samples, n_features) = prepared.dim();
        info!(
            "Building {} matrix from {} observations x {} variables.",
            kind, n_samples, n_features
        );

        let mut matrix = prepared.t().dot(&prepared);
        matrix /= (n_samples - 1) as f64;
        symmetrize(&mut matrix);
        if kind == MatrixKind::Correlation {
            matrix.diag_mut().fill(1.0);
        }
        debug!("{} matrix:\n{:.4}", kind, matrix);

        Self {
            matrix,
            kind,
            n_observations: Some(n_samples),
        }
    }

    /// Wraps a precomputed matrix after validating it.
    ///
    /// The matrix must be square with at least 2 variables, finite, symmetric within
    /// 1e-8, with a unit diagonal (correlation) or a positive diagonal (covariance).
    /// The stored copy is exactly symmetrized.
    pub fn from_matrix(
        mut matrix: Array2<f64>,
        kind: MatrixKind,
        n_observations: Option<usize>,
    ) -> FactorResult<Self> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(FactorError::InvalidInput(format!(
                "{} matrix must be square, got {}x{}.",
                kind, rows, cols
            )));
        }
        if rows < 2 {
            return Err(FactorError::InvalidInput(format!(
                "{} matrix must describe at least 2 variables, got {}.",
                kind, rows
            )));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidInput(format!(
                "{} matrix contains non-finite values.",
                kind
            )));
        }
        for i in 0..rows {
            for j in (i + 1)..cols {
                if !approx_eq!(f64, matrix[[i, j]], matrix[[j, i]], epsilon = SYMMETRY_TOLERANCE) {
                    return Err(FactorError::InvalidInput(format!(
                        "{} matrix is not symmetric at ({}, {}): {} vs {}.",
                        kind, i, j, matrix[[i, j]], matrix[[j, i]]
                    )));
                }
            }
        }
        for (i, &d) in matrix.diag().iter().enumerate() {
            let diagonal_ok = match kind {
                MatrixKind::Correlation => approx_eq!(f64, d, 1.0, epsilon = SYMMETRY_TOLERANCE),
                MatrixKind::Covariance => d > 0.0,
            };
            if !diagonal_ok {
                return Err(FactorError::InvalidInput(format!(
                    "{} matrix has an invalid diagonal entry {} for variable {}.",
                    kind, d, i
                )));
            }
        }
        if let Some(n) = n_observations {
            if n < 2 {
                return Err(FactorError::InvalidInput(format!(
                    "Observation count must be at least 2, got {}.",
                    n
                )));
            }
        }

        symmetrize(&mut matrix);
        if kind == MatrixKind::Correlation {
            matrix.diag_mut().fill(1.0);
        }
        Ok(Self {
            matrix,
            kind,
            n_observations,
        })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn n_variables(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_observations(&self) -> Option<usize> {
        self.n_observations
    }

    /// Per-variable total variance (the diagonal).
    pub fn variances(&self) -> Array1<f64> {
        self.matrix.diag().to_owned()
    }

    /// Sum of the diagonal; equals P in correlation mode.
    pub fn total_variance(&self) -> f64 {
        self.matrix.diag().sum()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.matrix
    }

    /// Rescales a covariance matrix to the corresponding correlation matrix.
    /// A correlation matrix is returned unchanged.
    pub fn to_correlation(&self) -> CorrelationMatrix {
        if self.kind == MatrixKind::Correlation {
            return self.clone();
        }
        let inv_sd = self.matrix.diag().mapv(|v| 1.0 / v.sqrt());
        let mut scaled = &self.matrix * &inv_sd;
        scaled *= &inv_sd.clone().insert_axis(Axis(1));
        symmetrize(&mut scaled);
        scaled.diag_mut().fill(1.0);
        CorrelationMatrix {
            matrix: scaled,
            kind: MatrixKind::Correlation,
            n_observations: self.n_observations,
        }
    }
}
