//! Launch errors.

use thiserror::Error;
use tiergrid_autoscale::AutoscaleError;
use tiergrid_core::{DurationError, LocationError, PortRangeError, TopologyError};
use tiergrid_dependent::DependentError;
use tiergrid_enrich::EnrichError;
use tiergrid_entity::EntityError;

pub type LaunchResult<T> = Result<T, LaunchError>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{entity}: unknown entity type {entity_type:?}")]
    UnknownType { entity: String, entity_type: String },

    #[error("location {0:?} is not supported; only localhost can be provisioned")]
    UnsupportedLocation(String),

    #[error("{entity}: {reason}")]
    InvalidTopology { entity: String, reason: String },

    #[error("enricher cycle through {0}")]
    EnricherCycle(String),

    /// The root entity failed to start.
    #[error("failed to start {entity}: {reason}")]
    Start { entity: String, reason: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("invalid management port: {0}")]
    Port(#[from] PortRangeError),

    #[error(transparent)]
    Duration(#[from] DurationError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Dependent(#[from] DependentError),

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error(transparent)]
    Autoscale(#[from] AutoscaleError),
}
