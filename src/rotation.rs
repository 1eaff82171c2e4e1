// src/rotation.rs

//! Factor rotation.
//!
//! Orthogonal rotations (Varimax, Quartimax) belong to the orthomax family and are
//! solved with Kaiser's pairwise plane rotations, each angle in closed form. Oblimin is
//! solved by gradient projection on the oblique transformation with a step-halving line
//! search. Promax starts from Varimax and fits an oblique transformation to a powered
//! target by least squares.
//!
//! For every method the returned `transformation` satisfies
//! `pattern = unrotated_loadings · transformation`. After rotation the factors are put in
//! order of decreasing explained variance and each column is sign-normalized so that its
//! sum is non-negative; callers should still compare solutions only up to sign and
//! column permutation.

use crate::error::{AnalysisStage, FactorError, FactorResult, FactorWarning};
use crate::extraction::{DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE};
use crate::linalg_backends::{general_inverse, symmetric_inverse};
use crate::variance::VarianceSummary;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_OBLIMIN_DELTA: f64 = 0.0;
pub const DEFAULT_PROMAX_POWER: f64 = 4.0;

/// Maximum number of step halvings in one oblimin line search.
const MAX_STEP_HALVINGS: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum RotationMethod {
    #[default]
    None,
    Varimax,
    Quartimax,
    /// Direct oblimin. `delta = 0` is quartimin.
    Oblimin { delta: f64 },
    /// Promax with the given target exponent.
    Promax { power: f64 },
}

impl RotationMethod {
    pub fn is_oblique(&self) -> bool {
        matches!(self, RotationMethod::Oblimin { .. } | RotationMethod::Promax { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RotationMethod::None => "none",
            RotationMethod::Varimax => "varimax",
            RotationMethod::Quartimax => "quartimax",
            RotationMethod::Oblimin { .. } => "oblimin",
            RotationMethod::Promax { .. } => "promax",
        }
    }
}

impl fmt::Display for RotationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationMethod::Oblimin { delta } => write!(f, "oblimin(delta={})", delta),
            RotationMethod::Promax { power } => write!(f, "promax(power={})", power),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for RotationMethod {
    type Err = FactorError;

    /// Parses a method name, optionally with its parameter as printed by `Display`
    /// (`oblimin(delta=0.5)`, `promax(power=3)`). Omitted parameters take their defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (name, argument) = match lowered.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    FactorError::InvalidInput(format!("Unbalanced parentheses in rotation '{}'.", s.trim()))
                })?;
                (name.trim(), Some(inner))
            }
            None => (lowered.as_str(), None),
        };
        match (name, argument) {
            ("none", None) => Ok(RotationMethod::None),
            ("varimax", None) => Ok(RotationMethod::Varimax),
            ("quartimax", None) => Ok(RotationMethod::Quartimax),
            ("oblimin" | "quartimin", None) => Ok(RotationMethod::Oblimin { delta: DEFAULT_OBLIMIN_DELTA }),
            ("oblimin", Some(arg)) => Ok(RotationMethod::Oblimin {
                delta: parse_parameter(arg, "delta")?,
            }),
            ("promax", None) => Ok(RotationMethod::Promax { power: DEFAULT_PROMAX_POWER }),
            ("promax", Some(arg)) => Ok(RotationMethod::Promax {
                power: parse_parameter(arg, "power")?,
            }),
            _ => Err(FactorError::InvalidInput(format!(
                "Unknown rotation '{}'; expected one of none, varimax, quartimax, oblimin, promax.",
                s.trim()
            ))),
        }
    }
}

/// Parses `key=value` (or a bare value) from a parenthesized rotation parameter.
fn parse_parameter(argument: &str, key: &str) -> FactorResult<f64> {
    let value = match argument.split_once('=') {
        Some((found, value)) if found.trim() == key => value,
        Some((found, _)) => {
            return Err(FactorError::InvalidInput(format!(
                "Unexpected rotation parameter '{}'; expected '{}'.",
                found.trim(),
                key
            )))
        }
        None => argument,
    };
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FactorError::InvalidInput(format!("Invalid value '{}' for {}.", value.trim(), key)))
}

/// Configuration for the rotation stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    pub method: RotationMethod,
    /// Normalize each loading row to unit length before rotating (Kaiser normalization).
    pub kaiser_normalize: bool,
    /// Orthogonal methods stop when the relative criterion change falls below this value;
    /// oblimin stops when the projected gradient norm does.
    pub tolerance: f64,
    /// Iteration cap (sweeps for orthogonal methods). Reaching it is a warning.
    pub max_iterations: usize,
    /// Emit per-iteration diagnostics at debug level.
    pub debug: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            method: RotationMethod::None,
            kaiser_normalize: true,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            debug: false,
        }
    }
}

impl RotationConfig {
    pub fn with_method(method: RotationMethod) -> Self {
        RotationConfig {
            method,
            ..Default::default()
        }
    }
}

/// Rotated factor solution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationResult {
    pub method: RotationMethod,
    /// Rotated loadings; the pattern matrix for oblique methods. Shape: (n_variables, n_factors)
    pub loadings: Array2<f64>,
    /// `loadings = unrotated · transformation`. Shape: (n_factors, n_factors)
    pub transformation: Array2<f64>,
    /// Variable-factor correlations `pattern · Phi`. Oblique methods only.
    pub structure: Option<Array2<f64>>,
    /// Factor correlation matrix with unit diagonal. Oblique methods only.
    pub factor_correlation: Option<Array2<f64>>,
    /// `diag(P Phi P^T)`; equal to the unrotated communalities for orthogonal methods.
    pub communalities: Array1<f64>,
    pub uniquenesses: Array1<f64>,
    /// Variance accounted for by each rotated factor, `diag(Phi P^T P)`.
    pub variance: VarianceSummary,
    pub iterations: usize,
    pub converged: bool,
    pub warnings: Vec<FactorWarning>,
}

impl RotationResult {
    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    pub fn is_oblique(&self) -> bool {
        self.factor_correlation.is_some()
    }

    /// The structure matrix; for orthogonal solutions this is the loading matrix itself.
    pub fn structure_or_loadings(&self) -> &Array2<f64> {
        self.structure.as_ref().unwrap_or(&self.loadings)
    }
}

/// The rotation that actually runs once the identity cases are handled.
enum Criterion {
    Orthomax { gamma: f64 },
    Oblimin { delta: f64 },
    Promax { power: f64 },
}

/// Outcome of an iterative rotation on the (possibly normalized) working matrix.
struct IterativeRotation {
    transformation: Array2<f64>,
    factor_correlation: Option<Array2<f64>>,
    iterations: usize,
    converged: bool,
    last_change: f64,
}

/// Orthomax criterion: sum over factors of the variance-like quantity
/// `sum_i l_ij^4 - gamma/p (sum_i l_ij^2)^2`. Varimax is gamma = 1, quartimax gamma = 0.
pub fn orthomax_criterion(loadings: ArrayView2<f64>, gamma: f64) -> f64 {
    let p = loadings.nrows() as f64;
    loadings
        .axis_iter(Axis(1))
        .map(|column| {
            let squares = column.mapv(|x| x * x);
            squares.dot(&squares) - gamma / p * squares.sum().powi(2)
        })
        .sum()
}

/// Replaces columns a and b of `matrix` by their plane rotation through angle (c, s).
fn rotate_plane(matrix: &mut Array2<f64>, a: usize, b: usize, c: f64, s: f64) {
    for mut row in matrix.axis_iter_mut(Axis(0)) {
        let x = row[a];
        let y = row[b];
        row[a] = c * x + s * y;
        row[b] = -s * x + c * y;
    }
}

/// Kaiser's pairwise orthomax: sweeps over all factor pairs, rotating each pair by the
/// angle that maximizes the criterion for that pair.
fn pairwise_orthomax(
    working: &Array2<f64>,
    gamma: f64,
    config: &RotationConfig,
) -> IterativeRotation {
    let (p, k) = working.dim();
    let p_f = p as f64;
    let mut rotated = working.clone();
    let mut transformation = Array2::<f64>::eye(k);
    let mut criterion = orthomax_criterion(rotated.view(), gamma);
    let mut iterations = 0;
    let mut converged = false;
    let mut last_change = f64::INFINITY;

    while iterations < config.max_iterations {
        iterations += 1;
        for a in 0..k {
            for b in (a + 1)..k {
                let (mut sum_u, mut sum_v, mut sum_c, mut sum_d) = (0.0, 0.0, 0.0, 0.0);
                for i in 0..p {
                    let x = rotated[[i, a]];
                    let y = rotated[[i, b]];
                    let u = x * x - y * y;
                    let v = 2.0 * x * y;
                    sum_u += u;
                    sum_v += v;
                    sum_c += u * u - v * v;
                    sum_d += 2.0 * u * v;
                }
                let numerator = sum_d - 2.0 * gamma * sum_u * sum_v / p_f;
                let denominator = sum_c - gamma * (sum_u * sum_u - sum_v * sum_v) / p_f;
                let angle = numerator.atan2(denominator) / 4.0;
                let (s, c) = angle.sin_cos();
                rotate_plane(&mut rotated, a, b, c, s);
                rotate_plane(&mut transformation, a, b, c, s);
            }
        }

        let updated = orthomax_criterion(rotated.view(), gamma);
        last_change = (updated - criterion).abs() / updated.abs().max(1e-12);
        criterion = updated;
        if config.debug {
            debug!(
                "orthomax(gamma={}) sweep {}: criterion {:.8}, relative change {:.3e}",
                gamma, iterations, criterion, last_change
            );
        }
        if last_change < config.tolerance {
            converged = true;
            break;
        }
    }

    IterativeRotation {
        transformation,
        factor_correlation: None,
        iterations,
        converged,
        last_change,
    }
}

/// Oblimin criterion value and its gradient with respect to the loadings.
fn oblimin_value_and_gradient(loadings: &Array2<f64>, delta: f64) -> (f64, Array2<f64>) {
    let (p, k) = loadings.dim();
    let squares = loadings.mapv(|x| x * x);
    let off_diagonal_ones = Array2::<f64>::ones((k, k)) - Array2::<f64>::eye(k);
    let mut cross = squares.dot(&off_diagonal_ones);
    if delta != 0.0 {
        let column_means = cross.sum_axis(Axis(0)) * (delta / p as f64);
        cross -= &column_means;
    }
    let value = (&squares * &cross).sum() / 4.0;
    let gradient = loadings * &cross;
    (value, gradient)
}

fn oblique_loadings(working: &Array2<f64>, t: &Array2<f64>) -> FactorResult<(Array2<f64>, Array2<f64>)> {
    let t_inverse = general_inverse(t, "oblique transformation").map_err(|e| match e {
        FactorError::SingularMatrix(msg) => {
            FactorError::DegenerateInput(format!("factors became collinear during rotation: {}", msg))
        }
        other => other,
    })?;
    let loadings = working.dot(&t_inverse.t());
    Ok((loadings, t_inverse))
}

/// Gradient of the criterion with respect to the transformation T.
fn transformation_gradient(loadings: &Array2<f64>, gq: &Array2<f64>, t_inverse: &Array2<f64>) -> Array2<f64> {
    -(loadings.t().dot(gq).dot(t_inverse)).reversed_axes()
}

/// Gradient projection for direct oblimin (Jennrich's oblique GPA).
fn gradient_projection_oblimin(
    working: &Array2<f64>,
    delta: f64,
    config: &RotationConfig,
) -> FactorResult<IterativeRotation> {
    let k = working.ncols();
    let mut t = Array2::<f64>::eye(k);
    let (mut loadings, mut t_inverse) = oblique_loadings(working, &t)?;
    let (mut value, mut gq) = oblimin_value_and_gradient(&loadings, delta);
    let mut gradient = transformation_gradient(&loadings, &gq, &t_inverse);
    let mut step = 1.0;
    let mut iterations = 0;
    let mut converged = false;
    let mut last_change;

    loop {
        let column_terms = (&t * &gradient).sum_axis(Axis(0));
        let projected = &gradient - &(&t * &column_terms);
        let s = projected.iter().map(|x| x * x).sum::<f64>().sqrt();
        last_change = s;
        if config.debug {
            debug!(
                "oblimin(delta={}) iteration {}: criterion {:.8}, projected gradient {:.3e}",
                delta, iterations, value, s
            );
        }
        if s < config.tolerance {
            converged = true;
            break;
        }
        if iterations >= config.max_iterations {
            break;
        }
        iterations += 1;

        step *= 2.0;
        let mut halvings = 0;
        let (t_trial, loadings_trial, t_inverse_trial, value_trial, gq_trial) = loop {
            let mut candidate = &t - &(&projected * step);
            let norms = candidate.map_axis(Axis(0), |c| c.dot(&c).sqrt());
            if norms.iter().any(|&n| !(n.is_finite() && n > 0.0)) {
                return Err(FactorError::DegenerateInput(
                    "oblique transformation lost a column during rotation".to_string(),
                ));
            }
            candidate /= &norms;
            let (l_candidate, t_inverse_candidate) = oblique_loadings(working, &candidate)?;
            let (v_candidate, gq_candidate) = oblimin_value_and_gradient(&l_candidate, delta);
            if value - v_candidate > 0.5 * s * s * step || halvings >= MAX_STEP_HALVINGS {
                break (candidate, l_candidate, t_inverse_candidate, v_candidate, gq_candidate);
            }
            step /= 2.0;
            halvings += 1;
        };

        t = t_trial;
        loadings = loadings_trial;
        t_inverse = t_inverse_trial;
        value = value_trial;
        gq = gq_trial;
        gradient = transformation_gradient(&loadings, &gq, &t_inverse);
    }

    let factor_correlation = t.t().dot(&t);
    Ok(IterativeRotation {
        transformation: t_inverse.reversed_axes(),
        factor_correlation: Some(factor_correlation),
        iterations,
        converged,
        last_change,
    })
}

/// Promax: Varimax, then a least-squares oblique fit to the elementwise power of the
/// row-normalized Varimax loadings (signs kept).
fn promax(working: &Array2<f64>, power: f64, config: &RotationConfig) -> FactorResult<IterativeRotation> {
    if !(power.is_finite() && power > 1.0) {
        return Err(FactorError::InvalidInput(format!(
            "Promax power must be greater than 1, got {}.",
            power
        )));
    }
    let varimax = pairwise_orthomax(working, 1.0, config);
    let rotated = working.dot(&varimax.transformation);
    let row_norms = rotated.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    let normalized = &rotated / &row_norms.insert_axis(Axis(1));
    let target = normalized.mapv(|x| x.signum() * x.abs().powf(power));

    let gram_inverse = symmetric_inverse(
        &normalized.t().dot(&normalized),
        "promax least-squares fit needs linearly independent varimax factors",
    )
    .map_err(degenerate_from_singular)?;
    let mut u = gram_inverse.dot(&normalized.t()).dot(&target);

    let scale = symmetric_inverse(&u.t().dot(&u), "promax transformation is singular")
        .map_err(degenerate_from_singular)?
        .diag()
        .mapv(f64::sqrt);
    u *= &scale;

    let u_inverse = general_inverse(&u, "promax transformation").map_err(degenerate_from_singular)?;
    let factor_correlation = u_inverse.dot(&u_inverse.t());
    if config.debug {
        debug!("promax(power={}) factor correlation:\n{:.5}", power, factor_correlation);
    }

    Ok(IterativeRotation {
        transformation: varimax.transformation.dot(&u),
        factor_correlation: Some(factor_correlation),
        iterations: varimax.iterations,
        converged: varimax.converged,
        last_change: varimax.last_change,
    })
}

fn degenerate_from_singular(e: FactorError) -> FactorError {
    match e {
        FactorError::SingularMatrix(msg) => FactorError::DegenerateInput(msg),
        other => other,
    }
}

/// Orders factors by decreasing variance and flips signs so every column sum is
/// non-negative, permuting the transformation and factor correlation consistently.
fn canonicalize(
    pattern: Array2<f64>,
    transformation: Array2<f64>,
    factor_correlation: Option<Array2<f64>>,
) -> (Array2<f64>, Array2<f64>, Option<Array2<f64>>) {
    let k = pattern.ncols();
    let cross = pattern.t().dot(&pattern);
    let variances: Array1<f64> = match &factor_correlation {
        Some(phi) => phi.dot(&cross).diag().to_owned(),
        None => cross.diag().to_owned(),
    };
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| {
        variances[b]
            .partial_cmp(&variances[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let signs: Array1<f64> = order
        .iter()
        .map(|&j| if pattern.column(j).sum() < 0.0 { -1.0 } else { 1.0 })
        .collect();

    let pattern = pattern.select(Axis(1), &order) * &signs;
    let transformation = transformation.select(Axis(1), &order) * &signs;
    let factor_correlation = factor_correlation.map(|phi| {
        let permuted = phi.select(Axis(0), &order).select(Axis(1), &order);
        let signed = &permuted * &signs;
        signed * &signs.clone().insert_axis(Axis(1))
    });
    (pattern, transformation, factor_correlation)
}

fn unrotated_result(
    loadings: ArrayView2<f64>,
    variances: ArrayView1<f64>,
    method: RotationMethod,
) -> FactorResult<RotationResult> {
    let loadings = loadings.to_owned();
    let communalities = loadings.map_axis(Axis(1), |row| row.dot(&row));
    let variance = VarianceSummary::from_loadings(loadings.view(), None, variances.sum())?;
    Ok(RotationResult {
        method,
        transformation: Array2::eye(loadings.ncols()),
        uniquenesses: &variances - &communalities,
        loadings,
        structure: None,
        factor_correlation: None,
        communalities,
        variance,
        iterations: 0,
        converged: true,
        warnings: Vec::new(),
    })
}

/// Rotates an unrotated loading matrix.
///
/// * `loadings` - Unrotated loadings, shape (n_variables, n_factors).
/// * `variable_variances` - Total variance of each variable (all ones for a correlation
///   matrix); used for uniquenesses and variance proportions.
///
/// With `RotationMethod::None` or a single factor the loadings are returned unchanged.
///
/// # Errors
/// * `InvalidInput` for mismatched shapes, a non-positive tolerance, or a Promax power <= 1.
/// * `DegenerateInput` when a loading row is entirely zero or the factors become collinear.
pub fn rotate(
    loadings: ArrayView2<f64>,
    variable_variances: ArrayView1<f64>,
    config: &RotationConfig,
) -> FactorResult<RotationResult> {
    let (p, k) = loadings.dim();
    if variable_variances.len() != p {
        return Err(FactorError::InvalidInput(format!(
            "Expected {} variable variances, got {}.",
            p,
            variable_variances.len()
        )));
    }
    if k == 0 {
        return Err(FactorError::InvalidInput("Loading matrix has no factors.".to_string()));
    }
    if !(config.tolerance.is_finite() && config.tolerance > 0.0) {
        return Err(FactorError::InvalidInput(format!(
            "Rotation tolerance must be positive, got {}.",
            config.tolerance
        )));
    }
    if loadings.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::InvalidInput("Loading matrix contains non-finite values.".to_string()));
    }

    let criterion = match config.method {
        _ if k == 1 => return unrotated_result(loadings, variable_variances, config.method),
        RotationMethod::None => return unrotated_result(loadings, variable_variances, config.method),
        RotationMethod::Varimax => Criterion::Orthomax { gamma: 1.0 },
        RotationMethod::Quartimax => Criterion::Orthomax { gamma: 0.0 },
        RotationMethod::Oblimin { delta } => Criterion::Oblimin { delta },
        RotationMethod::Promax { power } => Criterion::Promax { power },
    };

    let row_norms = loadings.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    if let Some(row) = row_norms.iter().position(|&n| n == 0.0) {
        return Err(FactorError::DegenerateInput(format!(
            "Loading row {} is entirely zero; its normalization is undefined.",
            row
        )));
    }

    info!("Rotating {} factors over {} variables with {}.", k, p, config.method);
    let start_time = std::time::Instant::now();

    let working: Array2<f64> = if config.kaiser_normalize {
        &loadings / &row_norms.clone().insert_axis(Axis(1))
    } else {
        loadings.to_owned()
    };

    let outcome = match criterion {
        Criterion::Orthomax { gamma } => pairwise_orthomax(&working, gamma, config),
        Criterion::Oblimin { delta } => gradient_projection_oblimin(&working, delta, config)?,
        Criterion::Promax { power } => promax(&working, power, config)?,
    };

    let pattern = loadings.dot(&outcome.transformation);
    let (pattern, transformation, factor_correlation) =
        canonicalize(pattern, outcome.transformation, outcome.factor_correlation);

    let structure = factor_correlation.as_ref().map(|phi| pattern.dot(phi));
    let communalities: Array1<f64> = match &structure {
        Some(s) => (&pattern * s).sum_axis(Axis(1)),
        None => pattern.map_axis(Axis(1), |row| row.dot(&row)),
    };
    let variance = VarianceSummary::from_loadings(
        pattern.view(),
        factor_correlation.as_ref().map(|phi| phi.view()),
        variable_variances.sum(),
    )?;

    let mut warnings = Vec::new();
    if !outcome.converged {
        warn!(
            "{} rotation did not converge within {} iterations (last change {:.3e}).",
            config.method, config.max_iterations, outcome.last_change
        );
        warnings.push(FactorWarning::NotConverged {
            stage: AnalysisStage::Rotation,
            iterations: outcome.iterations,
            last_change: outcome.last_change,
        });
    }
    info!(
        "Rotation finished in {:?} after {} iteration(s) (converged: {}).",
        start_time.elapsed(),
        outcome.iterations,
        outcome.converged
    );

    Ok(RotationResult {
        method: config.method,
        uniquenesses: &variable_variances - &communalities,
        loadings: pattern,
        transformation,
        structure,
        factor_correlation,
        communalities,
        variance,
        iterations: outcome.iterations,
        converged: outcome.converged,
        warnings,
    })
}
