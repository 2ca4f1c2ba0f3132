//! Typed error hierarchy for the studio.
//!
//! - `ValidationError`: a submission rejected before anything is persisted
//! - `StudioError`: producer, consumer and lookup failures

use thiserror::Error;

/// Why a submitted request value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message is required")]
    Empty,

    #[error("Message is too long ({actual} characters, maximum is {max})")]
    TooLong { max: usize, actual: usize },
}

/// Errors from the generation pipeline and its lookups.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Job {job_id} failed: {message}")]
    JobExecution { job_id: String, message: String },

    /// The event itself is unusable (unknown name, malformed payload).
    /// Retrying cannot help.
    #[error("Job {job_id} rejected: {reason}")]
    InvalidJob { job_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StudioError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ProjectNotFound { id: id.into() }
    }

    /// Whether a job failing with this error is worth redelivering.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::InvalidJob { .. } | Self::ProjectNotFound { .. }
        )
    }
}
