//! Error types for group resizing.

use thiserror::Error;
use tiergrid_entity::{EntityError, Lifecycle};

pub type ResizeResult<T> = Result<T, ResizeError>;

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("a resize of {group} is already in progress")]
    InProgress { group: String },

    #[error("{group} is {state}, not running")]
    NotRunning { group: String, state: Lifecycle },

    #[error("resize of {group} was cancelled by stop")]
    Cancelled { group: String },

    #[error("{group} has not been given a location")]
    NoLocation { group: String },
}

impl From<ResizeError> for EntityError {
    fn from(err: ResizeError) -> Self {
        match err {
            ResizeError::InProgress { group } => EntityError::ResizeInProgress { entity: group },
            ResizeError::NotRunning { group, state } => EntityError::NotRunning {
                entity: group,
                state,
            },
            ResizeError::Cancelled { group } => EntityError::Cancelled { entity: group },
            ResizeError::NoLocation { group } => EntityError::Provisioning {
                entity: group,
                reason: "no location".into(),
            },
        }
    }
}
