use thiserror::Error;

/// The shared error enum for the domain model crate, in the style of the
/// reference server's `MediaError`: a handful of named leaf variants
/// rather than one catch-all string.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid container description: {0}")]
    InvalidContainer(String),

    #[error("ffprobe output could not be parsed: {0}")]
    ProbeParse(String),

    #[error("ffmpeg plan could not be built: {0}")]
    PlanError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
