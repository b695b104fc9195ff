//! Crate-wide error type aggregating the per-module errors.

use thiserror::Error;

use crate::classify::ClassifierError;
use crate::features::FeatureError;
use crate::model::ModelError;
use crate::patient::CohortError;
use crate::personalize::PersonalizationError;
use crate::pipeline::PipelineError;

/// Any error the crate can produce, for callers that funnel everything
/// through one `Result` type.
#[derive(Error, Debug)]
pub enum DynotypeError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Cohort(#[from] CohortError),
    #[error(transparent)]
    Personalization(#[from] PersonalizationError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
