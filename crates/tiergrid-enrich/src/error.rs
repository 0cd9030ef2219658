//! Error types for enrichers.

use thiserror::Error;

pub type EnrichResult<T> = Result<T, EnrichError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnrichError {
    /// A transform rejected one input. The update is skipped.
    #[error("transform {transform} failed: {reason}")]
    Transform { transform: String, reason: String },

    #[error("unknown transform: {0}")]
    UnknownTransform(String),
}
