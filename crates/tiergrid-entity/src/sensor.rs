//! Sensors — named, typed, live attributes published by entities.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde_json::Value;

use crate::types::{EntityId, Lifecycle};

/// A typed sensor name.
pub struct Sensor<T> {
    name: Cow<'static, str>,
    description: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Sensor<T> {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            description,
            _marker: PhantomData,
        }
    }

    /// A sensor whose name is only known at runtime (e.g. from a topology).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            description: "",
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        self.description
    }
}

impl<T> Clone for Sensor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Sensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sensor({})", self.name)
    }
}

/// Whether a sensor value counts as "ready": present and not a default.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are not ready.
pub fn is_ready(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Storage for one (entity, sensor) pair.
///
/// The publish lock serialises writers of this cell across store and
/// dispatch. It is reentrant so a subscriber may publish back onto the same
/// cell from the dispatching thread.
pub(crate) struct SensorCell {
    value: RwLock<Option<Value>>,
    seq: AtomicU64,
    publish: ReentrantMutex<()>,
}

impl SensorCell {
    pub(crate) fn new() -> Self {
        Self {
            value: RwLock::new(None),
            seq: AtomicU64::new(0),
            publish: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn lock_publish(&self) -> ReentrantMutexGuard<'_, ()> {
        self.publish.lock()
    }

    /// Store a value and return its publish sequence number (1-based).
    pub(crate) fn store(&self, value: Value) -> u64 {
        let mut slot = self.value.write();
        *slot = Some(value);
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn value(&self) -> Option<Value> {
        self.value.read().clone()
    }
}

// ── Well-known sensors ─────────────────────────────────────────────

pub const SERVICE_STATE: Sensor<Lifecycle> =
    Sensor::new("service.state", "Lifecycle state of the entity");

pub const SERVICE_UP: Sensor<bool> =
    Sensor::new("service.up", "Whether the entity is running");

pub const SERVICE_PROBLEMS: Sensor<Vec<String>> =
    Sensor::new("service.problems", "Children that failed to start");

pub const HOST_ADDRESS: Sensor<String> =
    Sensor::new("host.address", "Address of the machine running the entity");

pub const MAIN_URI: Sensor<String> = Sensor::new("main.uri", "Primary URI of the service");

pub const DATASTORE_URL: Sensor<String> =
    Sensor::new("datastore.url", "Connection URL of a datastore");

pub const GROUP_SIZE: Sensor<u32> = Sensor::new("group.size", "Members currently in the group");

pub const GROUP_TARGET_SIZE: Sensor<u32> =
    Sensor::new("group.target.size", "Size the last resize aimed for");

pub const GROUP_MEMBERS: Sensor<Vec<EntityId>> =
    Sensor::new("group.members", "Ids of the group's members, oldest first");

pub const GROUP_RESIZE_FAILURES: Sensor<u32> =
    Sensor::new("group.resize.failures", "Members that failed to start in the last resize");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn readiness_follows_truthiness() {
        assert!(!is_ready(&Value::Null));
        assert!(!is_ready(&json!(false)));
        assert!(!is_ready(&json!(0)));
        assert!(!is_ready(&json!(0.0)));
        assert!(!is_ready(&json!("")));
        assert!(!is_ready(&json!([])));
        assert!(!is_ready(&json!({})));

        assert!(is_ready(&json!(true)));
        assert!(is_ready(&json!(3306)));
        assert!(is_ready(&json!("jdbc://10.0.0.5:3306")));
        assert!(is_ready(&json!(["a"])));
    }

    #[test]
    fn cell_sequence_increments() {
        let cell = SensorCell::new();
        assert_eq!(cell.value(), None);
        assert_eq!(cell.store(json!(1)), 1);
        assert_eq!(cell.store(json!(2)), 2);
        assert_eq!(cell.value(), Some(json!(2)));
    }

    #[test]
    fn dynamic_sensor_name() {
        let sensor: Sensor<f64> = Sensor::named(format!("{}.windowed", "load"));
        assert_eq!(sensor.name(), "load.windowed");
        assert_eq!(SERVICE_UP.name(), "service.up");
    }
}
