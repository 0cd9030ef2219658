//! Propagating and transforming enrichers.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tiergrid_entity::{Entity, OrchestrationContext, SensorEvent, SubscriptionBus, SubscriptionHandle};
use tracing::{debug, warn};

use crate::transform::{identity, TransformFn};

/// A live enricher. Dropping the handle leaves the enricher attached; call
/// `detach` to remove it.
pub struct EnricherHandle {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl EnricherHandle {
    pub(crate) fn new(name: String, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name,
            release: Some(Box::new(release)),
        }
    }

    pub(crate) fn from_subscriptions(
        name: String,
        bus: Weak<SubscriptionBus>,
        subscriptions: Vec<SubscriptionHandle>,
    ) -> Self {
        Self::new(name, move || {
            if let Some(bus) = bus.upgrade() {
                for handle in &subscriptions {
                    bus.unsubscribe(handle);
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn detach(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        debug!(enricher = %self.name, "enricher detached");
    }
}

impl std::fmt::Debug for EnricherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnricherHandle({})", self.name)
    }
}

/// Subscribe `handler` to a source cell and feed it the current value, both
/// under the cell's publish lock.
pub(crate) fn attach(
    ctx: &OrchestrationContext,
    source: &Entity,
    sensor: &str,
    handler: impl Fn(&Value) + Send + Sync + 'static,
) -> SubscriptionHandle {
    let handler = Arc::new(handler);
    source.observe_sensor(sensor, |current| {
        let subscribed = Arc::clone(&handler);
        let handle = ctx.subscribe(source.id(), sensor, move |event: &SensorEvent| {
            subscribed(&event.value)
        });
        if let Some(current) = current {
            handler(&current);
        }
        handle
    })
}

fn transform_one(
    ctx: &OrchestrationContext,
    source: &Entity,
    sensor: &str,
    target: &Arc<Entity>,
    target_sensor: &str,
    name: &str,
    f: TransformFn,
) -> SubscriptionHandle {
    let target: Weak<Entity> = Arc::downgrade(target);
    let target_sensor = target_sensor.to_string();
    let enricher = name.to_string();
    attach(ctx, source, sensor, move |value| {
        let Some(target) = target.upgrade() else {
            return;
        };
        match f(value) {
            Ok(out) => target.set_sensor_value(&target_sensor, out),
            Err(e) => warn!(
                enricher = %enricher,
                target = %target.id(),
                sensor = %target_sensor,
                error = %e,
                "transform failed, update skipped"
            ),
        }
    })
}

/// Republish `sensors` of `source` under the same names on `target`.
pub fn propagate(
    ctx: &OrchestrationContext,
    source: &Entity,
    target: &Arc<Entity>,
    sensors: &[String],
) -> EnricherHandle {
    let name = format!("propagate({} -> {})", source.label(), target.label());
    let subscriptions = sensors
        .iter()
        .map(|sensor| transform_one(ctx, source, sensor, target, sensor, &name, identity()))
        .collect();
    debug!(enricher = %name, sensors = ?sensors, "enricher attached");
    EnricherHandle::from_subscriptions(name, Arc::downgrade(ctx.bus()), subscriptions)
}

/// Republish `sensor` of `source` through `f` as `target_sensor` on
/// `target`. A failing transform skips that update only.
pub fn transform(
    ctx: &OrchestrationContext,
    source: &Entity,
    sensor: &str,
    target: &Arc<Entity>,
    target_sensor: &str,
    f: TransformFn,
) -> EnricherHandle {
    let name = format!(
        "transform({}:{sensor} -> {}:{target_sensor})",
        source.label(),
        target.label()
    );
    let handle = transform_one(ctx, source, sensor, target, target_sensor, &name, f);
    debug!(enricher = %name, "enricher attached");
    EnricherHandle::from_subscriptions(name, Arc::downgrade(ctx.bus()), vec![handle])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnrichError;
    use parking_lot::Mutex;
    use crate::transform::named_transform;
    use serde_json::json;
    use std::time::Duration;
    use tiergrid_entity::EntityBlueprint;

    fn pair(ctx: &OrchestrationContext) -> (Arc<Entity>, Arc<Entity>) {
        let source = ctx
            .create_entity(EntityBlueprint::new("web-server").named("web"))
            .unwrap();
        let target = ctx
            .create_entity(EntityBlueprint::new("application").named("app"))
            .unwrap();
        (source, target)
    }

    fn record(ctx: &OrchestrationContext, entity: &Entity, sensor: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.subscribe(entity.id(), sensor, move |e| sink.lock().push(e.value.clone()));
        seen
    }

    #[tokio::test]
    async fn propagates_every_update_in_order() {
        let ctx = OrchestrationContext::new();
        let (source, target) = pair(&ctx);
        let _enricher = propagate(&ctx, &source, &target, &["load".to_string()]);
        let seen = record(&ctx, &target, "load");

        for v in 1..=5 {
            source.set_sensor_value("load", json!(v));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock(), vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(target.sensor_value("load"), Some(json!(5)));
    }

    #[test]
    fn identity_transform_matches_propagation() {
        let ctx = OrchestrationContext::new();
        let (source, target) = pair(&ctx);
        let _p = propagate(&ctx, &source, &target, &["a".to_string()]);
        let _t = transform(&ctx, &source, "a", &target, "b", named_transform("identity").unwrap());
        let via_propagate = record(&ctx, &target, "a");
        let via_transform = record(&ctx, &target, "b");

        for v in [json!(1), json!("two"), json!([3]), json!(null)] {
            source.set_sensor_value("a", v);
        }
        assert_eq!(*via_propagate.lock(), *via_transform.lock());
        assert_eq!(via_propagate.lock().len(), 4);
    }

    #[test]
    fn current_value_is_synced_once_on_attach() {
        let ctx = OrchestrationContext::new();
        let (source, target) = pair(&ctx);
        source.set_sensor_value("main.uri", json!("http://127.0.0.1:8080/"));
        let seen = record(&ctx, &target, "main.uri");
        let _e = propagate(&ctx, &source, &target, &["main.uri".to_string()]);
        assert_eq!(*seen.lock(), vec![json!("http://127.0.0.1:8080/")]);
    }

    #[test]
    fn failing_transform_skips_only_that_update() {
        let ctx = OrchestrationContext::new();
        let (source, target) = pair(&ctx);
        let _e = transform(
            &ctx,
            &source,
            "reqs",
            &target,
            "reqs.n",
            named_transform("to_number").unwrap(),
        );
        let seen = record(&ctx, &target, "reqs.n");
        source.set_sensor_value("reqs", json!("10"));
        source.set_sensor_value("reqs", json!("garbage"));
        source.set_sensor_value("reqs", json!("12"));
        assert_eq!(*seen.lock(), vec![json!(10), json!(12)]);
    }

    #[test]
    fn transform_errors_carry_the_transform_name() {
        let f: TransformFn = Arc::new(|_| {
            Err(EnrichError::Transform {
                transform: "always_fails".into(),
                reason: "nope".into(),
            })
        });
        let err = f(&json!(1)).unwrap_err();
        assert_eq!(err.to_string(), "transform always_fails failed: nope");
    }

    #[test]
    fn detach_stops_enrichment() {
        let ctx = OrchestrationContext::new();
        let (source, target) = pair(&ctx);
        let e = propagate(&ctx, &source, &target, &["x".to_string()]);
        source.set_sensor_value("x", json!(1));
        e.detach();
        source.set_sensor_value("x", json!(2));
        assert_eq!(target.sensor_value("x"), Some(json!(1)));
    }
}
