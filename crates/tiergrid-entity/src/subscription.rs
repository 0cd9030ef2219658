//! Subscription bus: (entity, sensor) → ordered list of handlers.
//!
//! Handlers run synchronously on the publishing thread, in subscription
//! order, while the publisher holds the sensor cell's publish lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::types::EntityId;

/// One sensor publish, as seen by subscribers.
#[derive(Debug, Clone)]
pub struct SensorEvent {
    pub entity: EntityId,
    pub sensor: String,
    pub value: Value,
    /// Per-cell publish sequence number, starting at 1.
    pub seq: u64,
}

pub type SensorHandler = Arc<dyn Fn(&SensorEvent) + Send + Sync>;

/// Returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    entity: EntityId,
    sensor: String,
}

impl SubscriptionHandle {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn sensor(&self) -> &str {
        &self.sensor
    }
}

type CellKey = (EntityId, String);

#[derive(Default)]
pub struct SubscriptionBus {
    next_id: AtomicU64,
    subscribers: DashMap<CellKey, Vec<(u64, SensorHandler)>>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        entity: EntityId,
        sensor: &str,
        handler: SensorHandler,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .entry((entity, sensor.to_string()))
            .or_default()
            .push((id, handler));
        trace!(%entity, sensor, subscription = id, "subscribed");
        SubscriptionHandle {
            id,
            entity,
            sensor: sensor.to_string(),
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let key = (handle.entity, handle.sensor.clone());
        let mut removed = false;
        if let Some(mut list) = self.subscribers.get_mut(&key) {
            let before = list.len();
            list.retain(|(id, _)| *id != handle.id);
            removed = list.len() != before;
        }
        self.subscribers.remove_if(&key, |_, list| list.is_empty());
        removed
    }

    /// Invoke every handler of the event's cell, in subscription order.
    ///
    /// The handler list is snapshotted first so handlers may subscribe or
    /// unsubscribe without deadlocking the map shard.
    pub fn dispatch(&self, event: &SensorEvent) {
        let handlers: Vec<SensorHandler> = match self
            .subscribers
            .get(&(event.entity, event.sensor.clone()))
        {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, entity: EntityId, sensor: &str) -> usize {
        self.subscribers
            .get(&(entity, sensor.to_string()))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Drop every subscription on an entity's sensors.
    pub fn remove_entity(&self, entity: EntityId) {
        self.subscribers.retain(|(id, _), _| *id != entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(entity: u64, sensor: &str, value: Value, seq: u64) -> SensorEvent {
        SensorEvent {
            entity: EntityId(entity),
            sensor: sensor.into(),
            value,
            seq,
        }
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = SubscriptionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let log = log.clone();
            bus.subscribe(
                EntityId(1),
                "load",
                Arc::new(move |e| log.lock().push(format!("{tag}{}", e.value))),
            );
        }
        bus.dispatch(&event(1, "load", json!(7), 1));
        assert_eq!(*log.lock(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = SubscriptionBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = {
            let hits = hits.clone();
            bus.subscribe(
                EntityId(1),
                "load",
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        bus.dispatch(&event(1, "load", json!(1), 1));
        assert!(bus.unsubscribe(&h));
        assert!(!bus.unsubscribe(&h));
        bus.dispatch(&event(1, "load", json!(2), 2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EntityId(1), "load"), 0);
    }

    #[test]
    fn cells_are_independent() {
        let bus = SubscriptionBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        bus.subscribe(
            EntityId(1),
            "load",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.dispatch(&event(2, "load", json!(1), 1));
        bus.dispatch(&event(1, "other", json!(1), 1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.remove_entity(EntityId(1));
        bus.dispatch(&event(1, "load", json!(1), 1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = Arc::new(SubscriptionBus::new());
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let handle = {
            let bus2 = bus.clone();
            let slot = slot.clone();
            bus.subscribe(
                EntityId(3),
                "url",
                Arc::new(move |_| {
                    if let Some(h) = slot.lock().take() {
                        bus2.unsubscribe(&h);
                    }
                }),
            )
        };
        *slot.lock() = Some(handle);
        bus.dispatch(&event(3, "url", json!("x"), 1));
        assert_eq!(bus.subscriber_count(EntityId(3), "url"), 0);
    }
}
