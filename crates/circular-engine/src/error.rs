use std::time::Duration;

use circular_artifacts::ArtifactError;
use circular_core::collaborators::CollaboratorError;
use circular_store::StoreError;

/// Failures of the signing pipeline, grouped by how the caller recovers.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    // Rejected before the ledger is touched
    #[error("validation failed: {0}")]
    Validation(String),

    // Lost the race on supersede+insert; resubmitting is safe
    #[error("concurrent submission for the same child: {0}")]
    ConcurrencyConflict(String),

    // Recorded on the row and left for an operator
    #[error("document synthesis failed: {0}")]
    Synthesis(String),
    #[error("artifact persistence failed: {0}")]
    Persistence(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl SigningError {
    /// Only a lost submission race is safe to retry blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Synthesis(_) => "synthesis",
            Self::Persistence(_) => "persistence",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Collaborator(_) => "collaborator",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for SigningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(detail) => Self::ConcurrencyConflict(detail),
            StoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            StoreError::Invalid(detail) => Self::Validation(detail),
            other => Self::Store(other),
        }
    }
}

impl From<ArtifactError> for SigningError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(what) => Self::NotFound(what),
            other => Self::Persistence(other.to_string()),
        }
    }
}
