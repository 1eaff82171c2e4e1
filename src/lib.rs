// Exploratory factor analysis (EFA)

#![doc = include_str!("../README.md")]

pub mod analysis;
pub mod communality;
pub mod correlation;
pub mod diagnostics;
pub mod error;
pub mod extraction;
pub mod linalg_backends;
pub mod rotation;
pub mod scoring;
pub mod simulation;
pub mod variance;


pub use analysis::{FactorAnalysis, FactorAnalysisConfig, FactorAnalysisOutput, FactorModel, RotationObserver};
pub use correlation::{CorrelationMatrix, MatrixKind};
pub use error::{AnalysisStage, FactorError, FactorResult, FactorWarning};
pub use extraction::{ExtractionMethod, ExtractionResult};
pub use rotation::{RotationConfig, RotationMethod, RotationResult};
pub use scoring::{ScoreMatrix, ScoringMethod};
pub use variance::VarianceSummary;
