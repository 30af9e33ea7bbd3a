use thiserror::Error;

/// Failure classes of a single `detect_food` request.
///
/// All of them are request scoped. The pipeline performs no writes, so a
/// failed request never leaves anything to roll back.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The detector never initialized. Fatal until process restart.
    #[error("Model not loaded on server: {0}")]
    ModelUnavailable(String),

    #[error("File must be an image, got content type '{0}'")]
    UnsupportedMediaType(String),

    #[error("Invalid image file: {0}")]
    InvalidImage(String),

    /// Nutrition store unreachable, timed out or returned an error.
    #[error("Nutrition lookup failed: {0}")]
    ResolverFailure(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::UnsupportedMediaType(_) | PipelineError::InvalidImage(_) => 400,
            PipelineError::ModelUnavailable(_)
            | PipelineError::ResolverFailure(_)
            | PipelineError::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}
