//! tiergrid-autoscale — metric-driven resizing of a dynamic group.
//!
//! An `AutoscalerPolicy` watches one numeric sensor on a group entity and
//! keeps it inside a `[lower, upper]` band by resizing the group.
//!
//! # Scaling Algorithm
//!
//! ```text
//! n   = current group size
//! M   = latest metric value
//! mid = (lower + upper) / 2
//!
//! if M > upper:
//!     target = ceil(max(n, 1) * M / mid)
//! if M < lower:
//!     target = ceil(n * M / mid)
//!
//! target = clamp(target, min.size, max.size)   // clamping is a policy violation, logged
//! if target != n: resize(target)
//! ```
//!
//! One resize at a time: metric updates that arrive while a resize runs are
//! dropped. After a resize completes, updates are ignored for `cooldown`.
//! The policy only acts while the group is running.

pub mod error;
pub mod policy;

pub use error::{AutoscaleError, AutoscaleResult};
pub use policy::{AutoscalerPolicy, PolicyHandle, ScaleDecision};
