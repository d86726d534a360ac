//! Leaf error types for the worker pipeline. Each stage gets its own
//! enum; `anyhow` takes over at the binary boundary in `main.rs`.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job {0}: download failed after exhausting retries: {1}")]
    DownloadExhausted(Uuid, String),

    #[error("job {0}: downloaded {downloaded} bytes, expected {expected}")]
    DownloadSizeMismatch {
        job_id: Uuid,
        downloaded: u64,
        expected: u64,
    },

    #[error("job {0}: checksum mismatch for downloaded source")]
    ChecksumMismatch(Uuid),

    #[error("job {0}: source not found on coordinator")]
    NotFound(Uuid),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("job {0}: probe failed: {1}")]
    Probe(Uuid, #[source] transcodis_core::error::CoreError),

    #[error("job {0}: plan construction failed: {1}")]
    Plan(Uuid, #[source] transcodis_core::error::CoreError),

    #[error("job {0}: encoded duration {encoded}s deviates from source {source}s by more than the allowed tolerance")]
    DurationRegression {
        job_id: Uuid,
        source: f64,
        encoded: f64,
    },

    #[error("job {0}: encoded output is larger than the source ({encoded} > {source} bytes)")]
    SizeRegression {
        job_id: Uuid,
        source: u64,
        encoded: u64,
    },

    #[error("job {0}: upload failed after exhausting retries: {1}")]
    UploadExhausted(Uuid, String),

    #[error("job {0}: OCR request for pgs track {pgs_id} timed out")]
    OcrTimeout { job_id: Uuid, pgs_id: String },

    #[error("job {0}: OCR request for pgs track {pgs_id} failed: {message}")]
    OcrFailed {
        job_id: Uuid,
        pgs_id: String,
        message: String,
    },

    #[error("checkpoint I/O error at {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] transcodis_contracts::ProcessError),

    #[error(transparent)]
    EventBus(#[from] transcodis_contracts::EventBusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Cancellation is observed, not a stage failure: retry loops stop
    /// without counting it as a failed attempt, and the per-job handler
    /// leaves on-disk state intact instead of cleaning it up (§5, §7).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
            || matches!(self, PipelineError::Process(transcodis_contracts::ProcessError::Cancelled { .. }))
    }

    /// Terminal errors short-circuit a retry loop instead of being retried
    /// until the attempt cap is exhausted (§4.3, §7).
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineError::NotFound(_)) || self.is_cancellation()
    }
}
