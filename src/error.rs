//! Error types for the valuation and matching engine

use crate::models::{DisclosureStage, Exclusion, ValuationMethod};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Input / Normalization Errors
    // =============================

    /// Malformed or insufficient input. Never retried.
    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // =============================
    // Valuation Errors
    // =============================

    /// One method could not run. Recorded as an exclusion, not fatal.
    #[error("Valuation method {method} unavailable: {reason}")]
    ValuationMethodUnavailable {
        method: ValuationMethod,
        reason: String,
    },

    #[error("Insufficient comparables: {found} found, {required} required")]
    InsufficientComparables { found: usize, required: usize },

    #[error("Insufficient precedents: {found} found, {required} required")]
    InsufficientPrecedents { found: usize, required: usize },

    #[error("All valuation methods excluded ({} exclusions)", .exclusions.len())]
    ValuationExhausted { exclusions: Vec<Exclusion> },

    // =============================
    // Embedding / Matching Errors
    // =============================

    /// Transient provider failure, surfaced after the retry budget is spent.
    #[error("Embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// The provider refused the request itself (bad key, bad payload). Never retried.
    #[error("Embedding provider rejected request ({status}): {message}")]
    EmbeddingRejected { status: u16, message: String },

    #[error("Invalid disclosure transition from {from:?}: {reason}")]
    InvalidTransition {
        from: DisclosureStage,
        reason: String,
    },

    // =============================
    // Storage Errors
    // =============================

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// Method-level failures that aggregation turns into exclusions.
    pub fn is_method_level(&self) -> bool {
        matches!(
            self,
            EngineError::ValuationMethodUnavailable { .. }
                | EngineError::InsufficientComparables { .. }
                | EngineError::InsufficientPrecedents { .. }
        )
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::EmbeddingProvider(_) | EngineError::HttpError(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::DatabaseError(e.to_string())
    }
}
