//! tiergrid-group — dynamic groups of homogeneous members.
//!
//! A `DynamicGroup` is attached to an entity as both its startable and its
//! resizable behaviour. Members are created by a `MemberFactory`, become
//! children of the group entity before they are provisioned, and are
//! started in parallel.
//!
//! ```text
//!            start                    resize(t ≠ n)
//!   Empty ──────────► Stable(n) ─────────────────────► Resizing(n, t)
//!                        ▲                                   │
//!                        └──────── Stable(achieved) ◄────────┘
//! ```
//!
//! Only one resize runs at a time; a second request is rejected. Targets
//! are clamped to `[min.size, max.size]`. A resize that only partly
//! succeeds settles at the achieved size and reports the shortfall through
//! `group.size`, `group.target.size` and `group.resize.failures`.

pub mod error;
pub mod factory;
pub mod group;
pub mod state;

pub use error::{ResizeError, ResizeResult};
pub use factory::{BlueprintFactory, MemberFactory};
pub use group::{DynamicGroup, INITIAL_SIZE, MAX_SIZE, MIN_SIZE};
pub use state::{GroupState, GROUP_STATE};
