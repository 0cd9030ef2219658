//! Error types for dependent configuration.

use thiserror::Error;
use tiergrid_entity::EntityError;

pub type DependentResult<T> = Result<T, DependentError>;

#[derive(Debug, Error)]
pub enum DependentError {
    #[error("invalid template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("template {template:?} has {expected} placeholders but {got} arguments")]
    Arity {
        template: String,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Entity(#[from] EntityError),
}
