//! tiergrid-dependent — configuration that depends on other entities.
//!
//! A `PendingValue` is a one-shot cell: it resolves exactly once, and
//! callbacks registered on it run exactly once with the resolved value.
//!
//! ```text
//! db.set_sensor("datastore.url", …)
//!        │  (subscription)
//!        ▼
//! when_ready(db, datastore.url) ──┐
//! literal "brooklyn" ─────────────┼─► format_template("{}/visitors?user={}…")
//! literal "br00k11n" ─────────────┘            │ resolves when all inputs have
//!                                              ▼
//!                         bind_config(cluster, "db.url")
//!                           ├── configure_value on resolution
//!                           └── start gate: cluster waits until then
//! ```

pub mod bind;
pub mod error;
pub mod pending;
pub mod ready;
pub mod template;

pub use bind::bind_config;
pub use error::{DependentError, DependentResult};
pub use pending::PendingValue;
pub use ready::when_ready;
pub use template::{format_template, Resolvable};
