// src/analysis.rs

//! End-to-end factor analysis: observations → correlation matrix → extraction →
//! optional rotation → variance summary → diagnostics → optional scores.
//!
//! Correlation, communality, and extraction failures abort the fit. Rotation and
//! scoring failures are stored in their own result slots so the extraction stays usable.

use crate::correlation::{prepare_observations, ColumnStatistics, CorrelationMatrix, MatrixKind};
use crate::diagnostics::{fit_diagnostics, FitDiagnostics};
use crate::error::{FactorError, FactorResult, FactorWarning};
use crate::extraction::{extract, ExtractionConfig, ExtractionMethod, ExtractionResult, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE};
use crate::rotation::{rotate, RotationConfig, RotationMethod, RotationResult};
use crate::scoring::{compute_scores, ScoreMatrix, ScoringInputs, ScoringMethod};
use crate::variance::VarianceSummary;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Configuration of a complete analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorAnalysisConfig {
    /// Number of factors to retain (K), 1 <= K <= number of variables.
    pub n_factors: usize,
    /// Analyze the correlation (default) or the covariance of the variables.
    pub matrix_kind: MatrixKind,
    pub extraction_method: ExtractionMethod,
    /// Rotation settings; `RotationMethod::None` skips the rotation stage.
    pub rotation: RotationConfig,
    /// Score the fitting observations with this method. Requires `fit`, not `fit_correlation`.
    pub scoring: Option<ScoringMethod>,
    /// Extraction convergence tolerance (largest communality change).
    pub tolerance: f64,
    /// Extraction iteration cap.
    pub max_iterations: usize,
    /// Emit matrices and per-iteration detail at debug level. Never changes results.
    pub debug: bool,
}

impl Default for FactorAnalysisConfig {
    fn default() -> Self {
        FactorAnalysisConfig {
            n_factors: 1,
            matrix_kind: MatrixKind::Correlation,
            extraction_method: ExtractionMethod::Minres,
            rotation: RotationConfig::default(),
            scoring: None,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            debug: false,
        }
    }
}

/// Receives every successful rotation result. Observers only see results; they cannot
/// change them.
pub trait RotationObserver: Send + Sync {
    fn on_rotation(&self, result: &RotationResult);
}

/// A configured factor analysis, reusable across fits and shareable across threads.
#[derive(Clone)]
pub struct FactorAnalysis {
    config: FactorAnalysisConfig,
    observer: Option<Arc<dyn RotationObserver>>,
}

impl fmt::Debug for FactorAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorAnalysis")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Everything produced by one fit.
#[derive(Debug)]
pub struct FactorAnalysisOutput {
    pub correlation: CorrelationMatrix,
    pub extraction: ExtractionResult,
    /// `None` when no rotation was requested.
    pub rotation: Option<FactorResult<RotationResult>>,
    /// `None` when no scoring was requested.
    pub scores: Option<FactorResult<ScoreMatrix>>,
    /// Variance summary of the final solution: rotated when rotation succeeded,
    /// eigenvalue-based otherwise.
    pub variance: VarianceSummary,
    pub diagnostics: FitDiagnostics,
    /// Extraction warnings followed by rotation warnings.
    pub warnings: Vec<FactorWarning>,
    /// Reusable scorer, present when scores were computed.
    pub model: Option<FactorModel>,
}

impl FactorAnalysisOutput {
    fn rotated(&self) -> Option<&RotationResult> {
        self.rotation.as_ref().and_then(|r| r.as_ref().ok())
    }

    /// Final loadings: the rotated pattern when rotation succeeded, the unrotated
    /// loadings otherwise.
    pub fn loadings(&self) -> &Array2<f64> {
        self.rotated().map_or(&self.extraction.loadings, |r| &r.loadings)
    }

    pub fn structure(&self) -> Option<&Array2<f64>> {
        self.rotated().and_then(|r| r.structure.as_ref())
    }

    pub fn factor_correlation(&self) -> Option<&Array2<f64>> {
        self.rotated().and_then(|r| r.factor_correlation.as_ref())
    }

    pub fn communalities(&self) -> &Array1<f64> {
        self.rotated().map_or(&self.extraction.communalities, |r| &r.communalities)
    }

    pub fn uniquenesses(&self) -> &Array1<f64> {
        self.rotated().map_or(&self.extraction.uniquenesses, |r| &r.uniquenesses)
    }
}

impl FactorAnalysis {
    pub fn new(config: FactorAnalysisConfig) -> Self {
        FactorAnalysis { config, observer: None }
    }

    /// Attaches an observer that is called with every successful rotation.
    pub fn with_observer(mut self, observer: Arc<dyn RotationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &FactorAnalysisConfig {
        &self.config
    }

    /// Fits the model to raw observations, shape (n_observations, n_variables).
    ///
    /// # Errors
    /// Input validation, communality, and extraction errors. Rotation and scoring errors
    /// are reported inside the returned output.
    pub fn fit(&self, data: ArrayView2<f64>) -> FactorResult<FactorAnalysisOutput> {
        let (prepared, stats) = prepare_observations(data, self.config.matrix_kind)?;
        let correlation = CorrelationMatrix::from_prepared(prepared.view(), self.config.matrix_kind);
        self.run(correlation, Some((prepared, stats)))
    }

    /// Fits the model to a precomputed correlation or covariance matrix. Scores cannot
    /// be computed without observations; a requested scoring method yields an
    /// `InvalidInput` error in the `scores` slot.
    pub fn fit_correlation(&self, correlation: CorrelationMatrix) -> FactorResult<FactorAnalysisOutput> {
        self.run(correlation, None)
    }

    fn run(
        &self,
        correlation: CorrelationMatrix,
        prepared: Option<(Array2<f64>, ColumnStatistics)>,
    ) -> FactorResult<FactorAnalysisOutput> {
        let config = &self.config;
        let start_time = Instant::now();
        info!(
            "Factor analysis: {} variables, {} factor(s), {} extraction, {} rotation, {} matrix.",
            correlation.n_variables(),
            config.n_factors,
            config.extraction_method,
            config.rotation.method,
            correlation.kind()
        );

        let extraction = extract(
            &correlation,
            &ExtractionConfig {
                n_factors: config.n_factors,
                method: config.extraction_method,
                tolerance: config.tolerance,
                max_iterations: config.max_iterations,
                debug: config.debug,
            },
        )?;
        if config.debug {
            debug!("Unrotated loadings:\n{:.5}", extraction.loadings);
        }

        let rotation = if config.rotation.method == RotationMethod::None {
            None
        } else {
            let rotation_config = RotationConfig {
                debug: config.rotation.debug || config.debug,
                ..config.rotation.clone()
            };
            let outcome = rotate(
                extraction.loadings.view(),
                correlation.variances().view(),
                &rotation_config,
            );
            match &outcome {
                Ok(rotated) => {
                    if config.debug {
                        debug!("Rotated loadings:\n{:.5}", rotated.loadings);
                    }
                    if let Some(observer) = &self.observer {
                        observer.on_rotation(rotated);
                    }
                }
                Err(e) => warn!("Rotation failed ({}); continuing with unrotated loadings.", e),
            }
            Some(outcome)
        };

        let rotated = rotation.as_ref().and_then(|r| r.as_ref().ok());
        let (loadings, structure, factor_correlation, uniquenesses, variance) = match rotated {
            Some(r) => (
                r.loadings.view(),
                r.structure.as_ref().map(|s| s.view()),
                r.factor_correlation.as_ref().map(|phi| phi.view()),
                r.uniquenesses.view(),
                r.variance.clone(),
            ),
            None => (
                extraction.loadings.view(),
                None,
                None,
                extraction.uniquenesses.view(),
                extraction.variance.clone(),
            ),
        };

        let diagnostics = fit_diagnostics(&correlation, loadings, factor_correlation)?;
        info!("Root mean square residual: {:.5}", diagnostics.rmsr);

        let mut model = None;
        let scores = config.scoring.map(|method| match &prepared {
            Some((z, stats)) => {
                let inputs = ScoringInputs {
                    loadings,
                    structure,
                    factor_correlation,
                    correlation: &correlation,
                    uniquenesses,
                };
                let scored = compute_scores(z.view(), &inputs, method);
                if let Ok(score_matrix) = &scored {
                    let scales = match correlation.kind() {
                        MatrixKind::Correlation => stats.std_devs.clone(),
                        MatrixKind::Covariance => Array1::ones(stats.std_devs.len()),
                    };
                    model = Some(FactorModel {
                        kind: correlation.kind(),
                        method,
                        means: stats.means.clone(),
                        scales,
                        weights: score_matrix.weights.clone(),
                    });
                }
                if let Err(e) = &scored {
                    warn!("Scoring failed: {}", e);
                }
                scored
            }
            None => Err(FactorError::InvalidInput(
                "Factor scores need the original observations; fit with `fit` instead of `fit_correlation`."
                    .to_string(),
            )),
        });

        let mut warnings = extraction.warnings.clone();
        if let Some(r) = rotated {
            warnings.extend(r.warnings.iter().cloned());
        }

        info!("Factor analysis finished in {:?}.", start_time.elapsed());
        Ok(FactorAnalysisOutput {
            correlation,
            extraction,
            rotation,
            scores,
            variance,
            diagnostics,
            warnings,
            model,
        })
    }
}

/// Fitted scorer: prepares new observations exactly as the fitting data was prepared
/// and applies the stored score weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorModel {
    kind: MatrixKind,
    method: ScoringMethod,
    /// Column means of the fitting data. Shape: (n_variables)
    means: Array1<f64>,
    /// Standard deviations for a correlation analysis, ones for a covariance analysis.
    /// Always finite and positive. Shape: (n_variables)
    scales: Array1<f64>,
    /// Score weights. Shape: (n_variables, n_factors)
    weights: Array2<f64>,
}

impl FactorModel {
    /// Builds a model from externally computed parts.
    ///
    /// # Errors
    /// `InvalidInput` if the dimensions disagree or a mean, scale, or weight is not
    /// finite, or a scale is not positive.
    pub fn new(
        kind: MatrixKind,
        method: ScoringMethod,
        means: Array1<f64>,
        scales: Array1<f64>,
        weights: Array2<f64>,
    ) -> FactorResult<Self> {
        let model = FactorModel {
            kind,
            method,
            means,
            scales,
            weights,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> FactorResult<()> {
        let p = self.weights.nrows();
        if self.means.len() != p || self.scales.len() != p {
            return Err(FactorError::InvalidInput(format!(
                "Inconsistent model dimensions: weights have {} variables, means {}, scales {}.",
                p,
                self.means.len(),
                self.scales.len()
            )));
        }
        if p == 0 || self.weights.ncols() == 0 {
            return Err(FactorError::InvalidInput("Model has no variables or no factors.".to_string()));
        }
        if self.means.iter().chain(self.weights.iter()).any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidInput("Model contains non-finite means or weights.".to_string()));
        }
        if self.scales.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(FactorError::InvalidInput(
                "Model scale vector must contain finite positive values.".to_string(),
            ));
        }
        Ok(())
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn method(&self) -> ScoringMethod {
        self.method
    }

    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn scales(&self) -> &Array1<f64> {
        &self.scales
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn n_factors(&self) -> usize {
        self.weights.ncols()
    }

    /// Scores new observations, shape (n_observations, n_variables). Zero rows give an
    /// empty (0, n_factors) result.
    pub fn transform(&self, data: ArrayView2<f64>) -> FactorResult<Array2<f64>> {
        if data.ncols() != self.means.len() {
            return Err(FactorError::InvalidInput(format!(
                "Input has {} variables but the model was fitted on {}.",
                data.ncols(),
                self.means.len()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidInput("Input contains non-finite values.".to_string()));
        }
        if data.nrows() == 0 {
            return Ok(Array2::zeros((0, self.n_factors())));
        }
        let mut prepared = data.to_owned();
        for mut row in prepared.axis_iter_mut(Axis(0)) {
            ndarray::Zip::from(&mut row)
                .and(&self.means)
                .and(&self.scales)
                .for_each(|value, &mean, &scale| *value = (*value - mean) / scale);
        }
        Ok(prepared.dot(&self.weights))
    }

    /// Writes the model with bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> FactorResult<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| FactorError::Serialization(format!("Failed to serialize factor model: {}", e)))?;
        Ok(())
    }

    /// Reads a model written by `save_model` and checks it for consistency.
    pub fn load_model<P: AsRef<Path>>(path: P) -> FactorResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let model: FactorModel = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| FactorError::Serialization(format!("Failed to deserialize factor model: {}", e)))?;
        model.validate()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::sample_observations;
    use ndarray::array;
    use std::sync::Mutex;

    fn simulated_data() -> Array2<f64> {
        let loadings = array![
            [0.8, 0.0],
            [0.7, 0.1],
            [0.75, 0.0],
            [0.0, 0.7],
            [0.1, 0.6],
            [0.0, 0.65]
        ];
        sample_observations(loadings.view(), None, 200, 5).unwrap()
    }

    #[derive(Default)]
    struct CountingObserver {
        seen: Mutex<Vec<usize>>,
    }

    impl RotationObserver for CountingObserver {
        fn on_rotation(&self, result: &RotationResult) {
            self.seen.lock().unwrap().push(result.n_factors());
        }
    }

    #[test]
    fn analysis_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FactorAnalysis>();
    }

    #[test]
    fn observer_sees_each_rotation_without_changing_it() {
        let data = simulated_data();
        let config = FactorAnalysisConfig {
            n_factors: 2,
            rotation: RotationConfig::with_method(RotationMethod::Varimax),
            ..Default::default()
        };
        let observer = Arc::new(CountingObserver::default());
        let observed = FactorAnalysis::new(config.clone()).with_observer(observer.clone());
        let plain = FactorAnalysis::new(config);

        let with_observer = observed.fit(data.view()).unwrap();
        let without_observer = plain.fit(data.view()).unwrap();
        assert_eq!(*observer.seen.lock().unwrap(), vec![2]);
        assert_eq!(with_observer.loadings(), without_observer.loadings());
    }

    #[test]
    fn debug_flag_does_not_change_results() {
        let data = simulated_data();
        let config = FactorAnalysisConfig {
            n_factors: 2,
            rotation: RotationConfig::with_method(RotationMethod::Oblimin { delta: 0.0 }),
            ..Default::default()
        };
        let quiet = FactorAnalysis::new(config.clone()).fit(data.view()).unwrap();
        let verbose = FactorAnalysis::new(FactorAnalysisConfig { debug: true, ..config })
            .fit(data.view())
            .unwrap();
        assert_eq!(quiet.loadings(), verbose.loadings());
        assert_eq!(quiet.factor_correlation(), verbose.factor_correlation());
    }

    #[test]
    fn rotation_failure_keeps_extraction_and_scores_unrotated() {
        let data = simulated_data();
        let config = FactorAnalysisConfig {
            n_factors: 2,
            rotation: RotationConfig::with_method(RotationMethod::Promax { power: 1.0 }),
            scoring: Some(ScoringMethod::Regression),
            ..Default::default()
        };
        let output = FactorAnalysis::new(config).fit(data.view()).unwrap();
        assert!(matches!(output.rotation, Some(Err(FactorError::InvalidInput(_)))));
        assert_eq!(output.loadings(), &output.extraction.loadings);
        assert_eq!(output.variance, output.extraction.variance);
        let scores = output.scores.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(scores.scores.dim(), (200, 2));
    }

    #[test]
    fn scoring_without_observations_is_reported_in_its_slot() {
        let data = simulated_data();
        let correlation = CorrelationMatrix::from_observations(data.view(), MatrixKind::Correlation).unwrap();
        let config = FactorAnalysisConfig {
            n_factors: 2,
            scoring: Some(ScoringMethod::Bartlett),
            ..Default::default()
        };
        let output = FactorAnalysis::new(config).fit_correlation(correlation).unwrap();
        assert!(matches!(output.scores, Some(Err(FactorError::InvalidInput(_)))));
        assert!(output.model.is_none());
        assert!(output.rotation.is_none());
    }

    #[test]
    fn model_transform_reproduces_fitted_scores() {
        let data = simulated_data();
        for kind in [MatrixKind::Correlation, MatrixKind::Covariance] {
            let config = FactorAnalysisConfig {
                n_factors: 2,
                matrix_kind: kind,
                rotation: RotationConfig::with_method(RotationMethod::Varimax),
                scoring: Some(ScoringMethod::Bartlett),
                ..Default::default()
            };
            let output = FactorAnalysis::new(config).fit(data.view()).unwrap();
            let scores = output.scores.as_ref().unwrap().as_ref().unwrap();
            let model = output.model.as_ref().unwrap();
            assert_eq!(model.kind(), kind);
            let rescored = model.transform(data.view()).unwrap();
            for (a, b) in rescored.iter().zip(scores.scores.iter()) {
                assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
            }
            assert_eq!(model.transform(data.slice(ndarray::s![..0, ..])).unwrap().dim(), (0, 2));
            assert!(model.transform(data.slice(ndarray::s![.., ..3])).is_err());
        }
    }

    #[test]
    fn model_constructor_validates_parts() {
        let weights = Array2::<f64>::ones((3, 1));
        assert!(FactorModel::new(
            MatrixKind::Correlation,
            ScoringMethod::Regression,
            Array1::zeros(3),
            array![1.0, 0.0, 1.0],
            weights.clone(),
        )
        .is_err());
        assert!(FactorModel::new(
            MatrixKind::Correlation,
            ScoringMethod::Regression,
            Array1::zeros(2),
            Array1::ones(3),
            weights.clone(),
        )
        .is_err());
        assert!(FactorModel::new(
            MatrixKind::Correlation,
            ScoringMethod::Regression,
            Array1::zeros(3),
            Array1::ones(3),
            weights,
        )
        .is_ok());
    }
}
