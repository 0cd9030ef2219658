//! The orchestration context: entity registry and subscription bus.
//!
//! There is no process-wide state; every API that creates entities or
//! subscribes to sensors takes a context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::dump::TreeSnapshot;
use crate::entity::{Entity, EntityBlueprint};
use crate::error::{EntityError, EntityResult};
use crate::subscription::{SensorEvent, SubscriptionBus, SubscriptionHandle};
use crate::types::EntityId;

struct Inner {
    next_id: AtomicU64,
    entities: DashMap<EntityId, Arc<Entity>>,
    bus: Arc<SubscriptionBus>,
}

/// Cheaply cloneable handle shared by everything in one deployment.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Inner>,
}

impl OrchestrationContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                entities: DashMap::new(),
                bus: Arc::new(SubscriptionBus::new()),
            }),
        }
    }

    /// Instantiate and register an entity, applying the blueprint's
    /// initial configuration. Attach it to a parent with `add_child`.
    pub fn create_entity(&self, blueprint: EntityBlueprint) -> EntityResult<Arc<Entity>> {
        let id = EntityId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let entity = Arc::new(Entity::new(id, &blueprint, Arc::clone(&self.inner.bus)));
        for (key, value) in blueprint.config {
            entity.configure_value(&key, value)?;
        }
        debug!(entity = %id, entity_type = %entity.entity_type(), name = %entity.name(), "entity created");
        self.inner.entities.insert(id, Arc::clone(&entity));
        Ok(entity)
    }

    pub fn entity(&self, id: EntityId) -> EntityResult<Arc<Entity>> {
        self.inner
            .entities
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EntityError::NotFound(id.to_string()))
    }

    /// Look up a managed entity by display name.
    pub fn find(&self, name: &str) -> Option<Arc<Entity>> {
        let mut matches: Vec<Arc<Entity>> = self
            .inner
            .entities
            .iter()
            .filter(|e| e.value().name() == name)
            .map(|e| Arc::clone(e.value()))
            .collect();
        matches.sort_by_key(|e| e.id());
        matches.into_iter().next()
    }

    pub fn entities(&self) -> Vec<Arc<Entity>> {
        let mut all: Vec<Arc<Entity>> = self
            .inner
            .entities
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        all.sort_by_key(|e| e.id());
        all
    }

    pub fn subscribe(
        &self,
        entity: EntityId,
        sensor: &str,
        handler: impl Fn(&SensorEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.inner.bus.subscribe(entity, sensor, Arc::new(handler))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.bus.unsubscribe(handle)
    }

    pub fn bus(&self) -> &Arc<SubscriptionBus> {
        &self.inner.bus
    }

    /// Detach an entity from its parent and forget it and its descendants,
    /// dropping their subscriptions. Stop it first.
    pub fn unmanage(&self, entity: &Arc<Entity>) {
        if let Some(parent) = entity.parent() {
            parent.remove_child(entity.id());
        }
        let mut stack = vec![Arc::clone(entity)];
        while let Some(next) = stack.pop() {
            stack.extend(next.children());
            self.inner.entities.remove(&next.id());
            self.inner.bus.remove_entity(next.id());
            debug!(entity = %next.id(), "entity unmanaged");
        }
    }

    pub fn is_managed(&self, id: EntityId) -> bool {
        self.inner.entities.contains_key(&id)
    }

    /// Snapshot of the tree rooted at `root`.
    pub fn dump(&self, root: &Entity) -> TreeSnapshot {
        TreeSnapshot::capture(root)
    }
}

impl Default for OrchestrationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ids_are_unique_and_registered() {
        let ctx = OrchestrationContext::new();
        let a = ctx.create_entity(EntityBlueprint::new("basic")).unwrap();
        let b = ctx.create_entity(EntityBlueprint::new("basic")).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(ctx.entity(a.id()).unwrap().id(), a.id());
        assert_eq!(ctx.entities().len(), 2);
    }

    #[test]
    fn initial_config_is_validated() {
        let ctx = OrchestrationContext::new();
        let size: crate::ConfigKey<u32> = crate::ConfigKey::new("initial.size", "");
        let bad = EntityBlueprint::new("dynamic-cluster")
            .declare(&size)
            .configure_value("initial.size", Value::from("lots"));
        assert!(matches!(
            ctx.create_entity(bad),
            Err(EntityError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn find_by_name() {
        let ctx = OrchestrationContext::new();
        let db = ctx
            .create_entity(EntityBlueprint::new("database-node").named("db"))
            .unwrap();
        assert_eq!(ctx.find("db").map(|e| e.id()), Some(db.id()));
        assert!(ctx.find("nope").is_none());
    }

    #[test]
    fn unmanage_detaches_subtree_and_subscriptions() {
        let ctx = OrchestrationContext::new();
        let root = ctx.create_entity(EntityBlueprint::new("application")).unwrap();
        let group = ctx.create_entity(EntityBlueprint::new("dynamic-cluster")).unwrap();
        let member = ctx.create_entity(EntityBlueprint::new("web-server")).unwrap();
        root.add_child(group.clone());
        group.add_child(member.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        ctx.subscribe(member.id(), "load", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ctx.unmanage(&group);
        assert!(root.children().is_empty());
        assert!(group.parent().is_none());
        assert!(!ctx.is_managed(group.id()));
        assert!(!ctx.is_managed(member.id()));
        assert!(ctx.is_managed(root.id()));

        member.set_sensor_value("load", Value::from(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
