//! tiergrid-core — shared types for the tiergrid orchestrator.
//!
//! Holds everything that can be described without a running engine: the
//! recursive topology file format, port ranges (`8080+`), location specs
//! (`localhost`, `aws-ec2:eu-west-1`) and duration strings (`30s`, `5m`).

pub mod duration;
pub mod location;
pub mod ports;
pub mod topology;
pub mod types;

pub use duration::{parse_duration, DurationError};
pub use location::{LocationError, LocationSpec};
pub use ports::{PortRange, PortRangeError};
pub use topology::{
    ConfigValueSpec, EnricherSpec, EntitySpec, LaunchSection, PolicySpec, TopologyError,
    TopologySpec,
};
pub use types::*;
