//! Binding pending values to configuration keys.

use std::sync::Arc;

use serde_json::Value;
use tiergrid_entity::{Entity, EntityError, Mutability, start_gate};
use tracing::{debug, error, warn};

use crate::error::DependentResult;
use crate::pending::PendingValue;

/// Apply `pending` to `key` on `entity` when it resolves.
///
/// A pre-start key also gets a start gate so the entity does not start its
/// behaviour until the value is applied. Binding a pre-start key on an
/// entity whose configuration is already sealed fails with
/// `ConfigOrdering`.
pub fn bind_config(
    entity: &Arc<Entity>,
    key: &str,
    pending: PendingValue<Value>,
) -> DependentResult<()> {
    let target = Arc::downgrade(entity);
    let key = key.to_string();

    match entity.mutability(&key) {
        Mutability::PreStart => {
            let (gate, start) = start_gate(key.clone());
            entity.add_start_gate(start)?;
            debug!(entity = %entity.id(), key = %key, pending = pending.description(), "config bound");
            pending.on_resolved(move |value| {
                let Some(entity) = target.upgrade() else {
                    return;
                };
                match entity.configure_value(&key, value.clone()) {
                    Ok(()) => gate.open(),
                    Err(_) if entity.is_config_sealed() => {
                        let err = EntityError::ConfigOrdering {
                            entity: entity.label(),
                            key: key.clone(),
                        };
                        error!(entity = %entity.id(), key = %key, "{err}");
                        gate.fail(err.to_string());
                    }
                    Err(e) => {
                        warn!(entity = %entity.id(), key = %key, error = %e, "dependent config rejected");
                        gate.fail(e.to_string());
                    }
                }
            });
        }
        Mutability::Mutable => {
            debug!(entity = %entity.id(), key = %key, pending = pending.description(), "mutable config bound");
            pending.on_resolved(move |value| {
                if let Some(entity) = target.upgrade()
                    && let Err(e) = entity.configure_value(&key, value.clone())
                {
                    warn!(entity = %entity.id(), key = %key, error = %e, "dependent config rejected");
                }
            });
        }
    }
    Ok(())
}
