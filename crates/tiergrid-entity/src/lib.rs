//! tiergrid-entity — the entity model.
//!
//! Entities are nodes in an ownership tree. Each carries configuration,
//! live sensors and a lifecycle, and gains capabilities by having
//! behaviours attached rather than by subclassing.
//!
//! # Architecture
//!
//! ```text
//! OrchestrationContext
//!   ├── entity registry (EntityId → Arc<Entity>)
//!   ├── SubscriptionBus ((EntityId, sensor) → ordered handlers)
//!   └── Entity
//!       ├── config   (bound values, declared keys, inherited from ancestors)
//!       ├── sensors  (one cell per sensor, independently locked)
//!       ├── lifecycle (Created → Starting → Running → Stopping → Stopped)
//!       ├── start gates (preconditions awaited before start)
//!       └── behaviours (Startable, Resizable)
//! ```
//!
//! `Entity::set_sensor` is the only way a sensor changes. It stores the
//! value and then runs every subscriber of that (entity, sensor) pair on the
//! calling thread before returning, so subscribers observe updates in
//! publish order.

pub mod config;
pub mod context;
pub mod dump;
pub mod entity;
pub mod error;
pub mod gate;
pub mod location;
pub mod sensor;
pub mod subscription;
pub mod types;

pub use config::{ConfigKey, ConfigKeyDef, Mutability};
pub use context::OrchestrationContext;
pub use dump::TreeSnapshot;
pub use entity::{
    Behaviors, BoxFuture, Entity, EntityBlueprint, Resizable, ResizeOutcome, Startable,
};
pub use error::{EntityError, EntityResult};
pub use gate::{start_gate, GateHandle, GateState, StartGate};
pub use location::{
    LocalhostProvisioner, Location, Machine, PortRequest, ProvisionRequest, Provisioner,
    ProvisioningError,
};
pub use sensor::{is_ready, Sensor};
pub use subscription::{SensorEvent, SubscriptionBus, SubscriptionHandle};
pub use types::{Capability, EntityId, Lifecycle};
