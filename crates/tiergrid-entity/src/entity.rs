//! The `Entity` node: configuration, sensors, lifecycle and behaviours.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tiergrid_core::SizeRange;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ConfigKey, ConfigKeyDef, Mutability};
use crate::error::{EntityError, EntityResult};
use crate::gate::{GateState, StartGate};
use crate::location::Location;
use crate::sensor::{SERVICE_PROBLEMS, SERVICE_STATE, SERVICE_UP, Sensor, SensorCell};
use crate::subscription::{SensorEvent, SubscriptionBus};
use crate::types::{Capability, EntityId, Lifecycle};

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Behaviour run when an entity starts and stops.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self, entity: &Arc<Entity>, location: &Location) -> EntityResult<()>;

    async fn stop(&self, entity: &Arc<Entity>) -> EntityResult<()>;
}

/// Behaviour of entities whose size can be changed.
#[async_trait]
pub trait Resizable: Send + Sync {
    fn current_size(&self, entity: &Entity) -> u32;

    fn size_range(&self, entity: &Entity) -> SizeRange;

    async fn resize(&self, entity: &Arc<Entity>, target: u32) -> EntityResult<ResizeOutcome>;
}

/// Result of a resize. `achieved` may fall short of `requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeOutcome {
    pub from: u32,
    pub requested: u32,
    pub achieved: u32,
    pub failures: u32,
}

impl ResizeOutcome {
    pub fn is_partial(&self) -> bool {
        self.achieved != self.requested
    }
}

#[derive(Clone, Default)]
pub struct Behaviors {
    pub startable: Option<Arc<dyn Startable>>,
    pub resizable: Option<Arc<dyn Resizable>>,
}

/// Everything needed to instantiate an entity.
#[derive(Clone)]
pub struct EntityBlueprint {
    pub(crate) entity_type: String,
    pub(crate) name: Option<String>,
    pub(crate) declared: Vec<ConfigKeyDef>,
    pub(crate) config: Vec<(String, Value)>,
    pub(crate) behaviors: Behaviors,
}

impl EntityBlueprint {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: None,
            declared: Vec::new(),
            config: Vec::new(),
            behaviors: Behaviors::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declare a configuration key this entity type understands.
    pub fn declare<T: Serialize + DeserializeOwned>(mut self, key: &ConfigKey<T>) -> Self {
        self.declared.push(key.definition().clone());
        self
    }

    pub fn declare_def(mut self, def: ConfigKeyDef) -> Self {
        self.declared.push(def);
        self
    }

    pub fn configure<T: Serialize + DeserializeOwned>(mut self, key: &ConfigKey<T>, value: T) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.config.push((key.name().to_string(), value));
        }
        self
    }

    pub fn configure_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.push((key.into(), value));
        self
    }

    pub fn with_startable(mut self, startable: Arc<dyn Startable>) -> Self {
        self.behaviors.startable = Some(startable);
        self
    }

    pub fn with_resizable(mut self, resizable: Arc<dyn Resizable>) -> Self {
        self.behaviors.resizable = Some(resizable);
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }
}

/// A managed node of the entity tree.
pub struct Entity {
    id: EntityId,
    entity_type: String,
    name: String,
    parent: RwLock<Weak<Entity>>,
    children: RwLock<Vec<Arc<Entity>>>,
    declared: HashMap<String, ConfigKeyDef>,
    config: RwLock<BTreeMap<String, Value>>,
    config_sealed: AtomicBool,
    sensors: dashmap::DashMap<String, Arc<SensorCell>>,
    /// Reentrant so subscribers of `service.state` may read the lifecycle.
    lifecycle: ReentrantMutex<Cell<Lifecycle>>,
    gates: Mutex<Vec<StartGate>>,
    shutdown: watch::Sender<bool>,
    behaviors: Behaviors,
    bus: Arc<SubscriptionBus>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, blueprint: &EntityBlueprint, bus: Arc<SubscriptionBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            name: blueprint
                .name
                .clone()
                .unwrap_or_else(|| blueprint.entity_type.clone()),
            entity_type: blueprint.entity_type.clone(),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            declared: blueprint
                .declared
                .iter()
                .map(|d| (d.name.to_string(), d.clone()))
                .collect(),
            config: RwLock::new(BTreeMap::new()),
            config_sealed: AtomicBool::new(false),
            sensors: dashmap::DashMap::new(),
            lifecycle: ReentrantMutex::new(Cell::new(Lifecycle::Created)),
            gates: Mutex::new(Vec::new()),
            shutdown,
            behaviors: blueprint.behaviors.clone(),
            bus,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `name (id)`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.lock().get()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.behaviors.startable.is_some() {
            caps.push(Capability::Startable);
        }
        if self.behaviors.resizable.is_some() {
            caps.push(Capability::Resizable);
        }
        caps.push(Capability::HasSensors);
        caps
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    // ── Tree ───────────────────────────────────────────────────────

    pub fn parent(&self) -> Option<Arc<Entity>> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.children.read().clone()
    }

    pub fn add_child(self: &Arc<Self>, child: Arc<Entity>) {
        *child.parent.write() = Arc::downgrade(self);
        debug!(parent = %self.id, child = %child.id, "child added");
        self.children.write().push(child);
    }

    /// Detach a child. The caller is responsible for stopping it.
    pub fn remove_child(&self, id: EntityId) -> Option<Arc<Entity>> {
        let mut children = self.children.write();
        let index = children.iter().position(|c| c.id == id)?;
        let child = children.remove(index);
        *child.parent.write() = Weak::new();
        Some(child)
    }

    // ── Configuration ──────────────────────────────────────────────

    pub fn configure<T: Serialize + DeserializeOwned>(
        &self,
        key: &ConfigKey<T>,
        value: T,
    ) -> EntityResult<()> {
        let value = serde_json::to_value(value).map_err(|e| EntityError::InvalidConfig {
            entity: self.label(),
            key: key.name().to_string(),
            reason: e.to_string(),
        })?;
        self.configure_value(key.name(), value)
    }

    /// Bind a raw value. Undeclared keys are accepted and treated as
    /// pre-start keys.
    pub fn configure_value(&self, key: &str, value: Value) -> EntityResult<()> {
        let invalid = |reason: String| EntityError::InvalidConfig {
            entity: self.label(),
            key: key.to_string(),
            reason,
        };
        let def = self.declared.get(key);
        if let Some(def) = def
            && !def.accepts(&value)
        {
            return Err(invalid(format!("value {value} has the wrong type")));
        }
        let mutability = def.map(|d| d.mutability).unwrap_or(Mutability::PreStart);

        let mut config = self.config.write();
        if mutability == Mutability::PreStart && self.config_sealed.load(Ordering::Acquire) {
            return Err(invalid("key can only be set before the entity starts".into()));
        }
        debug!(entity = %self.id, key, %value, "configured");
        config.insert(key.to_string(), value);
        Ok(())
    }

    /// Typed lookup: own value, then ancestors, then the key's default.
    pub fn config<T: Serialize + DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.config_value(key.name())
            .and_then(|v| T::deserialize(&v).ok())
            .or_else(|| key.default_value())
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.config.read().get(key) {
            return Some(v.clone());
        }
        let mut ancestor = self.parent();
        while let Some(entity) = ancestor {
            if let Some(v) = entity.config.read().get(key) {
                return Some(v.clone());
            }
            ancestor = entity.parent();
        }
        self.declared.get(key).and_then(|d| d.default.clone())
    }

    /// Values bound directly on this entity.
    pub fn own_config(&self) -> BTreeMap<String, Value> {
        self.config.read().clone()
    }

    pub fn declared_key(&self, key: &str) -> Option<&ConfigKeyDef> {
        self.declared.get(key)
    }

    pub fn mutability(&self, key: &str) -> Mutability {
        self.declared
            .get(key)
            .map(|d| d.mutability)
            .unwrap_or(Mutability::PreStart)
    }

    pub fn is_config_sealed(&self) -> bool {
        self.config_sealed.load(Ordering::Acquire)
    }

    // ── Sensors ────────────────────────────────────────────────────

    pub fn set_sensor<T: Serialize>(&self, sensor: &Sensor<T>, value: T) {
        match serde_json::to_value(value) {
            Ok(value) => self.set_sensor_value(sensor.name(), value),
            Err(e) => warn!(entity = %self.id, sensor = sensor.name(), error = %e, "unserialisable sensor value"),
        }
    }

    /// Store a value and dispatch it to every subscriber of this cell
    /// before returning.
    pub fn set_sensor_value(&self, name: &str, value: Value) {
        let cell = Arc::clone(
            self.sensors
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(SensorCell::new()))
                .value(),
        );
        let _publish = cell.lock_publish();
        let seq = cell.store(value.clone());
        self.bus.dispatch(&SensorEvent {
            entity: self.id,
            sensor: name.to_string(),
            value,
            seq,
        });
    }

    /// Run `f` with the sensor's current value while holding its publish
    /// lock, so no publish can interleave. Used to subscribe and catch up
    /// atomically.
    pub fn observe_sensor<R>(&self, name: &str, f: impl FnOnce(Option<Value>) -> R) -> R {
        let cell = Arc::clone(
            self.sensors
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(SensorCell::new()))
                .value(),
        );
        let _publish = cell.lock_publish();
        f(cell.value())
    }

    pub fn get_sensor<T: DeserializeOwned>(&self, sensor: &Sensor<T>) -> Option<T> {
        self.sensor_value(sensor.name())
            .and_then(|v| T::deserialize(&v).ok())
    }

    pub fn sensor_value(&self, name: &str) -> Option<Value> {
        let cell = self.sensors.get(name).map(|c| Arc::clone(c.value()))?;
        cell.value()
    }

    pub fn sensors(&self) -> BTreeMap<String, Value> {
        let cells: Vec<(String, Arc<SensorCell>)> = self
            .sensors
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        cells
            .into_iter()
            .filter_map(|(name, cell)| cell.value().map(|v| (name, v)))
            .collect()
    }

    // ── Gates and shutdown ─────────────────────────────────────────

    /// Register a precondition for start. Fails once configuration is sealed.
    pub fn add_start_gate(&self, gate: StartGate) -> EntityResult<()> {
        let mut gates = self.gates.lock();
        if self.is_config_sealed() {
            return Err(EntityError::ConfigOrdering {
                entity: self.label(),
                key: gate.name.clone(),
            });
        }
        debug!(entity = %self.id, gate = %gate.name, "start gate added");
        gates.push(gate);
        Ok(())
    }

    /// Receiver that flips to `true` when the entity begins stopping.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Gates not yet open. When none remain, configuration is sealed.
    fn seal_or_pending(&self) -> EntityResult<Vec<StartGate>> {
        let gates = self.gates.lock();
        let mut pending = Vec::new();
        for gate in gates.iter() {
            match gate.state() {
                GateState::Open => {}
                GateState::Pending => pending.push(gate.clone()),
                GateState::Failed(reason) => {
                    return Err(EntityError::Start {
                        entity: self.label(),
                        reason: format!("start gate {} failed: {reason}", gate.name),
                    });
                }
            }
        }
        if pending.is_empty() {
            let _config = self.config.write();
            self.config_sealed.store(true, Ordering::Release);
        }
        Ok(pending)
    }

    async fn await_gates(&self) -> EntityResult<()> {
        let mut shutdown = self.shutdown_signal();
        loop {
            let pending = self.seal_or_pending()?;
            if pending.is_empty() {
                return Ok(());
            }
            for mut gate in pending {
                debug!(entity = %self.id, gate = %gate.name, "waiting on start gate");
                loop {
                    if *shutdown.borrow_and_update() {
                        return Err(EntityError::Cancelled {
                            entity: self.label(),
                        });
                    }
                    if *gate.rx.borrow_and_update() != GateState::Pending {
                        break;
                    }
                    tokio::select! {
                        changed = gate.rx.changed() => {
                            if changed.is_err() && *gate.rx.borrow() == GateState::Pending {
                                return Err(EntityError::Start {
                                    entity: self.label(),
                                    reason: format!("start gate {} was abandoned", gate.name),
                                });
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Err(EntityError::Cancelled { entity: self.label() });
                            }
                        }
                    }
                }
            }
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    fn transition(&self, state: &Cell<Lifecycle>, to: Lifecycle) -> EntityResult<()> {
        let from = state.get();
        if !from.can_transition(to) {
            return Err(EntityError::InvalidTransition {
                entity: self.label(),
                from,
                to,
            });
        }
        state.set(to);
        debug!(entity = %self.id, %from, %to, "lifecycle transition");
        self.set_sensor(&SERVICE_STATE, to);
        self.set_sensor(&SERVICE_UP, to == Lifecycle::Running);
        Ok(())
    }

    /// Start the entity and its `Created` children.
    ///
    /// Awaits start gates, seals configuration, runs the startable
    /// behaviour, then starts children in parallel. A failed child is listed
    /// in `service.problems` and does not fail this entity. Starting a
    /// running entity is a no-op.
    pub fn start(self: &Arc<Self>, location: Location) -> BoxFuture<'static, EntityResult<()>> {
        let entity = Arc::clone(self);
        Box::pin(async move { entity.run_start(location).await })
    }

    async fn run_start(self: Arc<Self>, location: Location) -> EntityResult<()> {
        {
            let state = self.lifecycle.lock();
            match state.get() {
                Lifecycle::Starting | Lifecycle::Running => return Ok(()),
                _ => self.transition(&state, Lifecycle::Starting)?,
            }
        }
        info!(entity = %self.id, name = %self.name, location = %location.spec, "starting");

        let result = self.start_inner(&location).await;

        let state = self.lifecycle.lock();
        match result {
            Ok(()) if state.get() == Lifecycle::Starting => {
                self.transition(&state, Lifecycle::Running)?;
                info!(entity = %self.id, name = %self.name, "running");
                Ok(())
            }
            Ok(()) => Err(EntityError::Cancelled {
                entity: self.label(),
            }),
            Err(e) => {
                if state.get() == Lifecycle::Starting {
                    self.transition(&state, Lifecycle::Failed)?;
                }
                warn!(entity = %self.id, name = %self.name, error = %e, "start failed");
                Err(e)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>, location: &Location) -> EntityResult<()> {
        self.await_gates().await?;
        if let Some(startable) = &self.behaviors.startable {
            startable.start(self, location).await?;
        }
        if self.is_shutting_down() {
            return Err(EntityError::Cancelled {
                entity: self.label(),
            });
        }

        let pending: Vec<Arc<Entity>> = self
            .children()
            .into_iter()
            .filter(|c| c.lifecycle() == Lifecycle::Created)
            .collect();
        let mut set = JoinSet::new();
        for child in pending {
            let location = location.clone();
            set.spawn(async move {
                let result = child.start(location).await;
                (child.label(), result)
            });
        }

        let mut problems = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) | Ok((_, Err(EntityError::Cancelled { .. }))) => {}
                Ok((label, Err(e))) => {
                    warn!(entity = %self.id, child = %label, error = %e, "child failed to start");
                    problems.push(label);
                }
                Err(e) => {
                    warn!(entity = %self.id, error = %e, "child start task aborted");
                    problems.push(format!("<aborted: {e}>"));
                }
            }
        }
        if !problems.is_empty() {
            problems.sort();
            self.set_sensor(&SERVICE_PROBLEMS, problems);
        }
        Ok(())
    }

    /// Stop children in reverse order, then this entity's behaviour.
    ///
    /// Idempotent: stopping a stopped or stopping entity does nothing.
    pub fn stop(self: &Arc<Self>) -> BoxFuture<'static, EntityResult<()>> {
        let entity = Arc::clone(self);
        Box::pin(async move { entity.run_stop().await })
    }

    async fn run_stop(self: Arc<Self>) -> EntityResult<()> {
        let was_created = {
            let state = self.lifecycle.lock();
            match state.get() {
                Lifecycle::Stopping | Lifecycle::Stopped => return Ok(()),
                Lifecycle::Created => {
                    self.transition(&state, Lifecycle::Stopped)?;
                    true
                }
                _ => {
                    self.transition(&state, Lifecycle::Stopping)?;
                    false
                }
            }
        };
        self.shutdown.send_replace(true);
        info!(entity = %self.id, name = %self.name, "stopping");

        for child in self.children().into_iter().rev() {
            if let Err(e) = child.stop().await {
                warn!(entity = %self.id, child = %child.id, error = %e, "child failed to stop");
            }
        }
        if was_created {
            return Ok(());
        }
        if let Some(startable) = &self.behaviors.startable
            && let Err(e) = startable.stop(&self).await
        {
            warn!(entity = %self.id, error = %e, "stop behaviour failed");
        }

        let state = self.lifecycle.lock();
        self.transition(&state, Lifecycle::Stopped)?;
        info!(entity = %self.id, name = %self.name, "stopped");
        Ok(())
    }

    // ── Resizing ───────────────────────────────────────────────────

    fn resizable(&self) -> EntityResult<&Arc<dyn Resizable>> {
        self.behaviors
            .resizable
            .as_ref()
            .ok_or_else(|| EntityError::NotResizable {
                entity: self.label(),
            })
    }

    pub fn current_size(&self) -> EntityResult<u32> {
        Ok(self.resizable()?.current_size(self))
    }

    pub fn size_range(&self) -> EntityResult<SizeRange> {
        Ok(self.resizable()?.size_range(self))
    }

    pub async fn resize(self: &Arc<Self>, target: u32) -> EntityResult<ResizeOutcome> {
        let resizable = Arc::clone(self.resizable()?);
        resizable.resize(self, target).await
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.entity_type)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
