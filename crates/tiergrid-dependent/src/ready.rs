//! `when_ready` — the first ready value of a sensor.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tiergrid_entity::{Entity, OrchestrationContext, Sensor, SubscriptionBus, SubscriptionHandle, is_ready};
use tracing::{debug, warn};

use crate::pending::PendingValue;

/// A pending value that resolves with the first ready value of `sensor`
/// on `entity`. Does not block.
///
/// If the sensor is already ready the value resolves before this returns.
/// Later updates are ignored; the subscription is dropped once resolved.
pub fn when_ready<T>(
    ctx: &OrchestrationContext,
    entity: &Arc<Entity>,
    sensor: &Sensor<T>,
) -> PendingValue<T>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    let pending = PendingValue::new(format!("{}:{}", entity.label(), sensor.name()));
    let handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let bus: Weak<SubscriptionBus> = Arc::downgrade(ctx.bus());

    let subscription = {
        let pending = pending.clone();
        let handle = Arc::clone(&handle);
        let bus = bus.clone();
        ctx.subscribe(entity.id(), sensor.name(), move |event| {
            if offer(&pending, &event.value) {
                release(&bus, &handle);
            }
        })
    };
    *handle.lock() = Some(subscription);

    // A value published before the subscription existed.
    if let Some(current) = entity.sensor_value(sensor.name()) {
        offer(&pending, &current);
    }
    if pending.is_resolved() {
        release(&bus, &handle);
    }
    pending
}

/// Try to resolve from a published value. Returns true once resolved.
fn offer<T>(pending: &PendingValue<T>, value: &Value) -> bool
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    if pending.is_resolved() {
        return true;
    }
    if !is_ready(value) {
        return false;
    }
    match T::deserialize(value) {
        Ok(typed) => {
            if pending.try_resolve(typed) {
                debug!(pending = pending.description(), %value, "dependency ready");
            }
            true
        }
        Err(e) => {
            warn!(pending = pending.description(), %value, error = %e, "ready value has the wrong type");
            false
        }
    }
}

fn release(bus: &Weak<SubscriptionBus>, handle: &Mutex<Option<SubscriptionHandle>>) {
    if let Some(bus) = bus.upgrade()
        && let Some(handle) = handle.lock().take()
    {
        bus.unsubscribe(&handle);
    }
}
