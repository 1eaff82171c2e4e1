// src/error.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by the factor analysis engine.
///
/// Errors from the correlation builder, the communality estimator and extraction abort
/// the whole analysis. Rotation and scoring errors are scoped to their own stage; the
/// pipeline keeps the extraction result usable when either of them fails.
#[derive(Error, Debug)]
pub enum FactorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Required matrix inverse does not exist: {0}")]
    SingularMatrix(String),

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("Matrix is not positive semi-definite (smallest eigenvalue {min_eigenvalue:.6e})")]
    NotPositiveSemidefinite { min_eigenvalue: f64 },

    #[error("Linear algebra backend failed: {0}")]
    Linalg(String),

    #[error("Model file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization failed: {0}")]
    Serialization(String),
}

pub type FactorResult<T> = Result<T, FactorError>;

/// Iterative stage that produced a warning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStage {
    Extraction,
    Rotation,
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStage::Extraction => f.write_str("extraction"),
            AnalysisStage::Rotation => f.write_str("rotation"),
        }
    }
}

/// Non-fatal conditions attached to a result. The result carrying them is still usable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FactorWarning {
    /// The iteration cap was reached before the convergence predicate held.
    /// Extraction returns its lowest-residual iterate, rotation its last one.
    NotConverged {
        stage: AnalysisStage,
        iterations: usize,
        last_change: f64,
    },
    /// Communalities exceeded the variable's total variance (Heywood case).
    HeywoodCase { variables: Vec<usize> },
    /// Initial communalities came from the max-absolute-correlation fallback
    /// because the input matrix could not be inverted.
    ApproximateCommunalities,
}

impl fmt::Display for FactorWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorWarning::NotConverged { stage, iterations, last_change } => write!(
                f,
                "{} did not converge within {} iterations (last change {:.3e})",
                stage, iterations, last_change
            ),
            FactorWarning::HeywoodCase { variables } => {
                write!(f, "communality exceeds total variance for variables {:?}", variables)
            }
            FactorWarning::ApproximateCommunalities => {
                f.write_str("initial communalities approximated by maximum absolute correlation")
            }
        }
    }
}
