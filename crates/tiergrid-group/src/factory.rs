//! The seam through which groups create members.

use std::sync::Arc;

use tiergrid_entity::{Entity, EntityBlueprint, EntityResult, OrchestrationContext};

pub trait MemberFactory: Send + Sync {
    /// Create (but do not attach or start) the `index`th member of `group`.
    fn create(
        &self,
        ctx: &OrchestrationContext,
        group: &Arc<Entity>,
        index: u32,
    ) -> EntityResult<Arc<Entity>>;
}

/// Creates every member from the same blueprint, named `<group>-<index>`.
pub struct BlueprintFactory {
    blueprint: EntityBlueprint,
}

impl BlueprintFactory {
    pub fn new(blueprint: EntityBlueprint) -> Self {
        Self { blueprint }
    }
}

impl MemberFactory for BlueprintFactory {
    fn create(
        &self,
        ctx: &OrchestrationContext,
        group: &Arc<Entity>,
        index: u32,
    ) -> EntityResult<Arc<Entity>> {
        ctx.create_entity(
            self.blueprint
                .clone()
                .named(format!("{}-{index}", group.name())),
        )
    }
}
