//! tiergrid-launch — from a topology file to a running entity tree.
//!
//! ```text
//! TopologySpec ──► build_tree ──► entities (Created)
//!                      │            ├── literal config
//!                      │            └── dependent config bound, start gates added
//!                      ├──► enrichers attached
//!                      └──► autoscaler policies attached
//!
//! Launcher::launch ──► root.start(localhost) ──► Deployment { dump, snapshot, stop }
//! ```
//!
//! Entity types come from a fixed catalog (`EntityKind`). Software
//! processes are simulated: they are given a localhost machine and ports
//! by the provisioner and publish where they would be reachable.

pub mod build;
pub mod catalog;
pub mod error;
pub mod launcher;
pub mod process;

pub use build::{build_tree, BuiltTree};
pub use catalog::EntityKind;
pub use error::{LaunchError, LaunchResult};
pub use launcher::{Deployment, Launcher, DEFAULT_LOCATION, DEFAULT_PORT};
pub use process::{
    ProcessKind, SoftwareProcess, ENABLED_PROTOCOLS, HTTPS, PROXY_HTTP_PORT, REQUESTS_PER_SECOND,
};
