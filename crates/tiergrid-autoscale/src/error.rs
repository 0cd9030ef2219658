//! Error types for autoscaler policies.

use thiserror::Error;

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

#[derive(Debug, Error, PartialEq)]
pub enum AutoscaleError {
    #[error("metric range [{lower}, {upper}] must be non-empty with a positive midpoint")]
    InvalidRange { lower: f64, upper: f64 },

    #[error("invalid cooldown: {0}")]
    InvalidCooldown(String),

    #[error("{entity} is not resizable")]
    NotResizable { entity: String },

    /// A computed target fell outside the group's size bounds and was
    /// clamped. Logged, never returned from the control loop.
    #[error("policy on {group} wanted {wanted} members, clamped to {clamped} by bounds [{min}, {max}]")]
    PolicyViolation {
        group: String,
        wanted: u32,
        clamped: u32,
        min: u32,
        max: u32,
    },
}
