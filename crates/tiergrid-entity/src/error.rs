//! Error types for the entity model.

use thiserror::Error;

use crate::types::Lifecycle;

/// Result type alias for entity operations.
pub type EntityResult<T> = Result<T, EntityError>;

/// Errors raised by entities, their configuration and their lifecycle.
///
/// Entities are named by their label (`name (id)`).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntityError {
    #[error("invalid config {key:?} on {entity}: {reason}")]
    InvalidConfig {
        entity: String,
        key: String,
        reason: String,
    },

    #[error("config {key:?} on {entity} resolved after the entity began starting")]
    ConfigOrdering { entity: String, key: String },

    #[error("provisioning failed for {entity}: {reason}")]
    Provisioning { entity: String, reason: String },

    #[error("failed to start {entity}: {reason}")]
    Start { entity: String, reason: String },

    #[error("start of {entity} was cancelled")]
    Cancelled { entity: String },

    #[error("{entity}: cannot move from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: Lifecycle,
        to: Lifecycle,
    },

    #[error("{entity} is not resizable")]
    NotResizable { entity: String },

    #[error("a resize of {entity} is already in progress")]
    ResizeInProgress { entity: String },

    #[error("{entity} is {state}, not running")]
    NotRunning { entity: String, state: Lifecycle },

    #[error("entity not found: {0}")]
    NotFound(String),
}

impl EntityError {
    /// Label of the entity the error is about, when there is one.
    pub fn entity(&self) -> Option<&str> {
        match self {
            EntityError::InvalidConfig { entity, .. }
            | EntityError::ConfigOrdering { entity, .. }
            | EntityError::Provisioning { entity, .. }
            | EntityError::Start { entity, .. }
            | EntityError::Cancelled { entity }
            | EntityError::InvalidTransition { entity, .. }
            | EntityError::NotResizable { entity }
            | EntityError::ResizeInProgress { entity }
            | EntityError::NotRunning { entity, .. } => Some(entity),
            EntityError::NotFound(_) => None,
        }
    }
}
