/// Failure of one pose generation or catalog operation, tagged by the stage
/// that failed.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no signed-in session")]
    Unauthenticated,

    #[error("All models failed. Last error: {last_error}")]
    Synthesis { last_error: String },

    #[error("background removal failed: {0:#}")]
    PostProcessing(anyhow::Error),

    #[error("upload failed: {0:#}")]
    Storage(anyhow::Error),

    #[error("database write failed: {0:#}")]
    Persistence(anyhow::Error),
}

impl GenerationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable short tag, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthenticated => "unauthenticated",
            Self::Synthesis { .. } => "synthesis",
            Self::PostProcessing(_) => "post_processing",
            Self::Storage(_) => "storage",
            Self::Persistence(_) => "persistence",
        }
    }
}
