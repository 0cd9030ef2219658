//! tiergrid-enrich — standing computations over sensors.
//!
//! Every enricher is a subscription on a source (entity, sensor) cell. The
//! handler runs on the publishing thread while the source cell's publish
//! lock is held, so an enricher sees each source update exactly once and in
//! publish order, and republishes before the source `set_sensor` returns.
//!
//! ```text
//! source.set_sensor(s, v)
//!   └─► handler(v) ─► transform(v) ─► target.set_sensor(t, v')
//!                          │
//!                          └─ Err → warn!, update skipped
//! ```
//!
//! Kinds:
//! - propagate: a fixed set of sensors, same names, identity transform
//! - transform: one sensor through a `TransformFn`, optionally renamed
//! - rolling mean: mean of numeric samples in a sliding time window
//! - aggregate: sum/mean/min/max of one sensor across a group's members

pub mod aggregate;
pub mod enricher;
pub mod error;
pub mod rolling;
pub mod transform;

pub use aggregate::aggregate_members;
pub use enricher::{propagate, transform, EnricherHandle};
pub use error::{EnrichError, EnrichResult};
pub use rolling::{rolling_mean, RollingWindow};
pub use transform::{named_transform, TransformFn};

