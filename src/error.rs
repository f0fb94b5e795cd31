//! Pipeline error kinds (spec.md §7).
//!
//! Expected, matchable failure modes are a `thiserror` enum so call sites
//! can branch on kind; the process/operational boundary (`main.rs`,
//! background task supervisors) collapses everything to `anyhow::Error`,
//! mirroring the teacher's split between typed errors on domain structs
//! (`auth/models.rs::RateLimitError`) and `anyhow::Result` everywhere else.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance {
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("poison message: {0}")]
    Poison(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// §7: local recovery only where provably safe; everything else is
    /// surfaced. This says which errors a bus consumer should retry rather
    /// than route straight to the DLQ.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::UpstreamUnavailable(_) | PipelineError::Conflict(_))
    }

    /// §7: poison messages skip retry entirely and go straight to the DLQ.
    pub fn is_poison(&self) -> bool {
        matches!(self, PipelineError::Poison(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "Validation",
            PipelineError::InsufficientBalance { .. } => "InsufficientBalance",
            PipelineError::Conflict(_) => "Conflict",
            PipelineError::NotFound(_) => "NotFound",
            PipelineError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            PipelineError::Poison(_) => "Poison",
            PipelineError::ConfigurationError(_) => "ConfigurationError",
            PipelineError::Fatal(_) => "Fatal",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Fatal(format!("sqlite: {e}"))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
