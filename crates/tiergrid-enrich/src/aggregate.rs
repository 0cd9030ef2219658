//! Aggregation of one sensor across the members of a group.
//!
//! Membership is read from the group's `group.members` sensor. Each member
//! gets its own subscription; the folded value is republished on the target
//! after every member update and every membership change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tiergrid_core::Aggregation;
use tiergrid_entity::sensor::GROUP_MEMBERS;
use tiergrid_entity::{
    Entity, EntityId, OrchestrationContext, SensorEvent, SubscriptionBus, SubscriptionHandle,
};
use tracing::{debug, trace, warn};

use crate::enricher::{attach, EnricherHandle};

#[derive(Default)]
struct Members {
    current: BTreeSet<EntityId>,
    subscriptions: BTreeMap<EntityId, SubscriptionHandle>,
    values: BTreeMap<EntityId, Value>,
    detached: bool,
}

struct Aggregator {
    group: Weak<Entity>,
    target: Weak<Entity>,
    bus: Weak<SubscriptionBus>,
    sensor: String,
    target_sensor: String,
    aggregation: Aggregation,
    state: Mutex<Members>,
}

impl Aggregator {
    /// Fold and publish. Called with the state lock held so publishes
    /// follow the order of the updates that caused them.
    fn publish(&self, members: &Members) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        let values: Vec<Value> = members.values.values().cloned().collect();
        target.set_sensor_value(&self.target_sensor, self.aggregation.fold(&values));
    }

    fn on_member_update(&self, member: EntityId, value: &Value) {
        let mut members = self.state.lock();
        if members.detached || !members.current.contains(&member) {
            return;
        }
        if value.is_null() {
            members.values.remove(&member);
        } else {
            members.values.insert(member, value.clone());
        }
        self.publish(&members);
    }

    fn on_membership(self: &Arc<Self>, ids: Vec<EntityId>) {
        let (Some(group), Some(bus)) = (self.group.upgrade(), self.bus.upgrade()) else {
            return;
        };
        let wanted: BTreeSet<EntityId> = ids.into_iter().collect();
        let (added, removed) = {
            let mut members = self.state.lock();
            if members.detached {
                return;
            }
            let added: Vec<EntityId> = wanted.difference(&members.current).copied().collect();
            let gone: Vec<EntityId> = members.current.difference(&wanted).copied().collect();
            let mut removed = Vec::new();
            for id in &gone {
                members.values.remove(id);
                if let Some(handle) = members.subscriptions.remove(id) {
                    removed.push(handle);
                }
            }
            members.current = wanted;
            (added, removed)
        };
        for handle in &removed {
            bus.unsubscribe(handle);
        }

        let children = group.children();
        for id in added {
            let Some(member) = children.iter().find(|c| c.id() == id) else {
                trace!(group = %group.id(), member = %id, "member not a child, skipped");
                continue;
            };
            let this = Arc::clone(self);
            let handle = member.observe_sensor(&self.sensor, |current| {
                let handle = bus.subscribe(
                    id,
                    &self.sensor,
                    Arc::new(move |event: &SensorEvent| this.on_member_update(id, &event.value)),
                );
                if let Some(v) = current.filter(|v| !v.is_null()) {
                    self.state.lock().values.insert(id, v);
                }
                handle
            });
            self.state.lock().subscriptions.insert(id, handle);
        }

        let members = self.state.lock();
        self.publish(&members);
    }

    fn detach(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut members = self.state.lock();
            members.detached = true;
            std::mem::take(&mut members.subscriptions).into_values().collect()
        };
        if let Some(bus) = self.bus.upgrade() {
            for handle in &handles {
                bus.unsubscribe(handle);
            }
        }
    }
}

/// Publish `aggregation` of `sensor` over the members of `group` as
/// `target_sensor` on `target`, usually the group itself.
pub fn aggregate_members(
    ctx: &OrchestrationContext,
    group: &Arc<Entity>,
    sensor: &str,
    target: &Arc<Entity>,
    target_sensor: &str,
    aggregation: Aggregation,
) -> EnricherHandle {
    let name = format!(
        "aggregate({}:{sensor} {aggregation:?} -> {}:{target_sensor})",
        group.label(),
        target.label()
    );
    let aggregator = Arc::new(Aggregator {
        group: Arc::downgrade(group),
        target: Arc::downgrade(target),
        bus: Arc::downgrade(ctx.bus()),
        sensor: sensor.to_string(),
        target_sensor: target_sensor.to_string(),
        aggregation,
        state: Mutex::new(Members::default()),
    });

    let membership = {
        let aggregator = Arc::clone(&aggregator);
        let enricher = name.clone();
        attach(ctx, group, GROUP_MEMBERS.name(), move |value| {
            match serde_json::from_value::<Vec<EntityId>>(value.clone()) {
                Ok(ids) => aggregator.on_membership(ids),
                Err(e) => warn!(enricher = %enricher, error = %e, "unreadable member list"),
            }
        })
    };
    debug!(enricher = %name, "enricher attached");

    let bus = Arc::downgrade(ctx.bus());
    EnricherHandle::new(name, move || {
        if let Some(bus) = bus.upgrade() {
            bus.unsubscribe(&membership);
        }
        aggregator.detach();
    })
}
