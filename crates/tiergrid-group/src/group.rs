//! `DynamicGroup` — the startable and resizable behaviour of a group entity.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tiergrid_core::SizeRange;
use tiergrid_entity::sensor::{GROUP_MEMBERS, GROUP_RESIZE_FAILURES, GROUP_SIZE, GROUP_TARGET_SIZE};
use tiergrid_entity::{
    ConfigKey, Entity, EntityBlueprint, EntityError, EntityResult, Lifecycle, Location,
    OrchestrationContext, Resizable, ResizeOutcome, Startable,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ResizeError, ResizeResult};
use crate::factory::MemberFactory;
use crate::state::{GROUP_STATE, GroupState};

pub static INITIAL_SIZE: LazyLock<ConfigKey<u32>> = LazyLock::new(|| {
    ConfigKey::new("initial.size", "Members created when the group starts").with_default(1)
});

pub static MIN_SIZE: LazyLock<ConfigKey<u32>> = LazyLock::new(|| {
    ConfigKey::new("min.size", "Fewest members a resize may leave")
        .with_default(0)
        .mutable()
});

pub static MAX_SIZE: LazyLock<ConfigKey<u32>> = LazyLock::new(|| {
    ConfigKey::new("max.size", "Most members a resize may create")
        .with_default(u32::MAX)
        .mutable()
});

pub struct DynamicGroup {
    ctx: OrchestrationContext,
    factory: Arc<dyn MemberFactory>,
    /// Held for the whole of a resize, and by stop.
    resize_lock: tokio::sync::Mutex<()>,
    /// Running members, oldest first.
    members: Mutex<Vec<Arc<Entity>>>,
    location: Mutex<Option<Location>>,
    next_index: AtomicU32,
}

impl DynamicGroup {
    pub fn new(ctx: OrchestrationContext, factory: Arc<dyn MemberFactory>) -> Self {
        Self {
            ctx,
            factory,
            resize_lock: tokio::sync::Mutex::new(()),
            members: Mutex::new(Vec::new()),
            location: Mutex::new(None),
            next_index: AtomicU32::new(0),
        }
    }

    /// Blueprint for a group entity with this behaviour attached.
    pub fn blueprint(
        ctx: &OrchestrationContext,
        entity_type: &str,
        factory: Arc<dyn MemberFactory>,
    ) -> EntityBlueprint {
        let group = Arc::new(DynamicGroup::new(ctx.clone(), factory));
        EntityBlueprint::new(entity_type)
            .declare(&INITIAL_SIZE)
            .declare(&MIN_SIZE)
            .declare(&MAX_SIZE)
            .with_startable(group.clone())
            .with_resizable(group)
    }

    pub fn members(&self) -> Vec<Arc<Entity>> {
        self.members.lock().clone()
    }

    fn size(&self) -> u32 {
        self.members.lock().len() as u32
    }

    fn bounds(entity: &Entity) -> SizeRange {
        SizeRange::new(
            entity.config(&MIN_SIZE).unwrap_or(0),
            entity.config(&MAX_SIZE).unwrap_or(u32::MAX),
        )
    }

    fn publish(&self, group: &Entity, state: GroupState) {
        let members: Vec<_> = self.members.lock().iter().map(|m| m.id()).collect();
        group.set_sensor(&GROUP_SIZE, members.len() as u32);
        group.set_sensor(&GROUP_MEMBERS, members);
        group.set_sensor(&GROUP_STATE, state);
    }

    /// Resize while holding the resize lock.
    async fn resize_locked(
        &self,
        group: &Arc<Entity>,
        requested: u32,
    ) -> ResizeResult<ResizeOutcome> {
        let bounds = Self::bounds(group);
        let target = bounds.clamp(requested);
        if target != requested {
            debug!(group = %group.id(), requested, target, "resize target clamped to size bounds");
        }
        let from = self.size();
        if target == from {
            return Ok(ResizeOutcome {
                from,
                requested: target,
                achieved: from,
                failures: 0,
            });
        }

        info!(group = %group.id(), from, to = target, "resizing");
        group.set_sensor(&GROUP_STATE, GroupState::Resizing { from, to: target });
        group.set_sensor(&GROUP_TARGET_SIZE, target);

        let failures = if target > from {
            self.grow(group, target - from).await?
        } else {
            self.shrink(from - target).await;
            0
        };

        let achieved = self.size();
        group.set_sensor(&GROUP_RESIZE_FAILURES, failures);
        self.publish(group, GroupState::Stable { size: achieved });
        if achieved == target {
            info!(group = %group.id(), size = achieved, "resize complete");
        } else {
            warn!(group = %group.id(), target, achieved, failures, "resize partially failed");
        }
        Ok(ResizeOutcome {
            from,
            requested: target,
            achieved,
            failures,
        })
    }

    /// Add `count` members. Returns how many failed to start.
    async fn grow(&self, group: &Arc<Entity>, count: u32) -> ResizeResult<u32> {
        let location =
            self.location
                .lock()
                .clone()
                .ok_or_else(|| ResizeError::NoLocation {
                    group: group.label(),
                })?;
        let mut shutdown = group.shutdown_signal();
        let mut failures = 0;

        // Register before provisioning so a stop can always find them.
        let mut fresh = Vec::new();
        for _ in 0..count {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
            match self.factory.create(&self.ctx, group, index) {
                Ok(member) => {
                    group.add_child(Arc::clone(&member));
                    fresh.push(member);
                }
                Err(e) => {
                    warn!(group = %group.id(), error = %e, "member creation failed");
                    failures += 1;
                }
            }
        }

        let mut set = JoinSet::new();
        for member in &fresh {
            let member = Arc::clone(member);
            let location = location.clone();
            set.spawn(async move {
                let result = member.start(location).await;
                (member, result)
            });
        }

        let mut started = Vec::new();
        let cancelled = loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break false,
                    Some(Ok((member, Ok(())))) => started.push(member),
                    Some(Ok((member, Err(e)))) => {
                        warn!(group = %group.id(), member = %member.id(), error = %e, "member failed to start");
                        failures += 1;
                    }
                    Some(Err(e)) => {
                        warn!(group = %group.id(), error = %e, "member start task failed");
                        failures += 1;
                    }
                },
                _ = stopping(&mut shutdown) => break true,
            }
        };

        if cancelled {
            set.abort_all();
            while set.join_next().await.is_some() {}
            for member in &fresh {
                self.discard(member).await;
            }
            info!(group = %group.id(), discarded = fresh.len(), "resize cancelled by stop");
            return Err(ResizeError::Cancelled {
                group: group.label(),
            });
        }

        for member in &fresh {
            if !started.iter().any(|m| m.id() == member.id()) {
                self.discard(member).await;
            }
        }
        started.sort_by_key(|m| m.id());
        self.members.lock().extend(started);
        Ok(failures)
    }

    /// Remove the `count` newest members.
    async fn shrink(&self, count: u32) {
        let doomed: Vec<Arc<Entity>> = {
            let mut members = self.members.lock();
            let keep = members.len().saturating_sub(count as usize);
            members.split_off(keep)
        };
        for member in doomed.iter().rev() {
            self.discard(member).await;
        }
    }

    /// Stop a member and remove it from the tree.
    async fn discard(&self, member: &Arc<Entity>) {
        if let Err(e) = member.stop().await {
            warn!(member = %member.id(), error = %e, "member failed to stop");
        }
        self.ctx.unmanage(member);
        debug!(member = %member.id(), "member removed");
    }
}

async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

#[async_trait]
impl Startable for DynamicGroup {
    async fn start(&self, entity: &Arc<Entity>, location: &Location) -> EntityResult<()> {
        *self.location.lock() = Some(location.clone());
        let _resize = self.resize_lock.lock().await;
        self.publish(entity, GroupState::Empty);

        let initial = entity.config(&INITIAL_SIZE).unwrap_or(1);
        let outcome = self.resize_locked(entity, initial).await?;
        if outcome.from == outcome.requested {
            self.publish(entity, GroupState::Stable { size: outcome.achieved });
        }
        Ok(())
    }

    async fn stop(&self, entity: &Arc<Entity>) -> EntityResult<()> {
        // Waits for an in-flight resize to notice the shutdown and unwind.
        let _resize = self.resize_lock.lock().await;
        let members: Vec<Arc<Entity>> = std::mem::take(&mut *self.members.lock());
        for member in members.iter().rev() {
            self.discard(member).await;
        }
        self.publish(entity, GroupState::Empty);
        Ok(())
    }
}

#[async_trait]
impl Resizable for DynamicGroup {
    fn current_size(&self, _entity: &Entity) -> u32 {
        self.size()
    }

    fn size_range(&self, entity: &Entity) -> SizeRange {
        Self::bounds(entity)
    }

    async fn resize(&self, entity: &Arc<Entity>, target: u32) -> EntityResult<ResizeOutcome> {
        let state = entity.lifecycle();
        if state != Lifecycle::Running {
            return Err(ResizeError::NotRunning {
                group: entity.label(),
                state,
            }
            .into());
        }
        let _resize = self
            .resize_lock
            .try_lock()
            .map_err(|_| EntityError::from(ResizeError::InProgress {
                group: entity.label(),
            }))?;
        Ok(self.resize_locked(entity, target).await?)
    }
}
