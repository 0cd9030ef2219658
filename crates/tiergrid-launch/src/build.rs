//! Building an entity tree from a topology.
//!
//! Two passes: first every entity is created with its literal
//! configuration, then (once every name resolves) dependent configuration
//! is bound and enrichers and policies are attached.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tiergrid_autoscale::{AutoscalerPolicy, PolicyHandle};
use tiergrid_core::{parse_duration, ConfigValueSpec, EnricherSpec, EntitySpec, PolicySpec, TopologySpec};
use tiergrid_dependent::{bind_config, format_template, when_ready, PendingValue, Resolvable};
use tiergrid_enrich::{
    aggregate_members, named_transform, propagate, rolling_mean, transform, EnricherHandle,
};
use tiergrid_entity::{Entity, EntityError, EntityResult, OrchestrationContext, Sensor};
use tiergrid_group::{DynamicGroup, MemberFactory};
use tracing::debug;

use crate::catalog::EntityKind;
use crate::error::{LaunchError, LaunchResult};

/// The result of building a topology: an unstarted tree plus the enrichers
/// and policies wired into it.
pub struct BuiltTree {
    pub root: Arc<Entity>,
    pub enrichers: Vec<EnricherHandle>,
    pub policies: Vec<PolicyHandle>,
}

/// Build the tree described by `topology` inside `ctx`. Must be called
/// from within a tokio runtime when the topology declares policies.
pub fn build_tree(ctx: &OrchestrationContext, topology: &TopologySpec) -> LaunchResult<BuiltTree> {
    topology.validate()?;
    check_enricher_graph(&topology.root)?;

    let mut created = Vec::new();
    let root = create(ctx, &topology.root, &mut created)?;

    let mut enrichers = Vec::new();
    let mut policies = Vec::new();
    for (entity, spec) in &created {
        bind_dependent(ctx, entity, spec)?;
        for enricher in &spec.enrichers {
            enrichers.push(attach_enricher(ctx, entity, enricher)?);
        }
        for policy in &spec.policies {
            policies.push(attach_policy(ctx, entity, policy)?);
        }
    }
    debug!(
        root = %root.id(),
        entities = created.len(),
        enrichers = enrichers.len(),
        policies = policies.len(),
        "topology built"
    );
    Ok(BuiltTree {
        root,
        enrichers,
        policies,
    })
}

fn create<'s>(
    ctx: &OrchestrationContext,
    spec: &'s EntitySpec,
    created: &mut Vec<(Arc<Entity>, &'s EntitySpec)>,
) -> LaunchResult<Arc<Entity>> {
    let entity = instantiate(ctx, spec, spec.display_name())?;
    created.push((Arc::clone(&entity), spec));
    for child in &spec.children {
        let child = create(ctx, child, created)?;
        entity.add_child(child);
    }
    Ok(entity)
}

/// Create one entity with its literal configuration.
fn instantiate(ctx: &OrchestrationContext, spec: &EntitySpec, name: &str) -> LaunchResult<Arc<Entity>> {
    let kind: EntityKind = spec
        .entity_type
        .parse()
        .map_err(|entity_type| LaunchError::UnknownType {
            entity: name.to_string(),
            entity_type,
        })?;

    let blueprint = match kind {
        EntityKind::DynamicCluster => {
            let Some(member) = spec.member.as_deref() else {
                return Err(LaunchError::InvalidTopology {
                    entity: name.to_string(),
                    reason: "dynamic-cluster needs a member template".to_string(),
                });
            };
            if !member.children.is_empty() {
                return Err(LaunchError::InvalidTopology {
                    entity: name.to_string(),
                    reason: "member templates cannot have children".to_string(),
                });
            }
            member
                .entity_type
                .parse::<EntityKind>()
                .map_err(|entity_type| LaunchError::UnknownType {
                    entity: format!("{name} member"),
                    entity_type,
                })?;
            let factory = Arc::new(TemplateFactory {
                template: member.clone(),
            });
            DynamicGroup::blueprint(ctx, kind.as_str(), factory)
        }
        other => other.blueprint(),
    };

    let blueprint = spec
        .config
        .iter()
        .filter_map(|(key, value)| match value {
            ConfigValueSpec::Literal(v) => Some((key, v)),
            _ => None,
        })
        .fold(blueprint.named(name), |bp, (key, value)| {
            bp.configure_value(key.clone(), value.clone())
        });
    Ok(ctx.create_entity(blueprint)?)
}

fn lookup(ctx: &OrchestrationContext, name: &str) -> LaunchResult<Arc<Entity>> {
    ctx.find(name).ok_or_else(|| LaunchError::InvalidTopology {
        entity: name.to_string(),
        reason: "no entity with this name".to_string(),
    })
}

/// Turn a configuration value into a pending value.
fn resolve(ctx: &OrchestrationContext, value: &ConfigValueSpec) -> LaunchResult<PendingValue<Value>> {
    match value {
        ConfigValueSpec::Literal(v) => Ok(PendingValue::resolved("literal", v.clone())),
        ConfigValueSpec::WhenReady { when_ready: r } => {
            let source = lookup(ctx, &r.entity)?;
            Ok(when_ready(ctx, &source, &Sensor::<Value>::named(r.sensor.clone())))
        }
        ConfigValueSpec::Format { format, args } => {
            let args = args
                .iter()
                .map(|arg| match arg {
                    ConfigValueSpec::Literal(v) => Ok(Resolvable::Literal(v.clone())),
                    other => resolve(ctx, other).map(Resolvable::Pending),
                })
                .collect::<LaunchResult<Vec<_>>>()?;
            let text = format_template(format, args)?;
            let value = PendingValue::new(text.description());
            let sink = value.clone();
            text.on_resolved(move |s| {
                sink.try_resolve(Value::String(s.clone()));
            });
            Ok(value)
        }
    }
}

fn bind_dependent(ctx: &OrchestrationContext, entity: &Arc<Entity>, spec: &EntitySpec) -> LaunchResult<()> {
    for (key, value) in &spec.config {
        if value.is_literal() {
            continue;
        }
        let pending = resolve(ctx, value)?;
        bind_config(entity, key, pending)?;
    }
    Ok(())
}

fn attach_enricher(
    ctx: &OrchestrationContext,
    target: &Arc<Entity>,
    spec: &EnricherSpec,
) -> LaunchResult<EnricherHandle> {
    let source = match spec.source() {
        Some(name) => lookup(ctx, name)?,
        None => Arc::clone(target),
    };
    let handle = match spec {
        EnricherSpec::Propagate { sensors, .. } => propagate(ctx, &source, target, sensors),
        EnricherSpec::Transform {
            sensor,
            target_sensor,
            transform: name,
            ..
        } => transform(
            ctx,
            &source,
            sensor,
            target,
            target_sensor.as_deref().unwrap_or(sensor),
            named_transform(name)?,
        ),
        EnricherSpec::RollingMean {
            sensor,
            target_sensor,
            window,
            ..
        } => rolling_mean(ctx, &source, sensor, target, target_sensor, parse_duration(window)?),
        EnricherSpec::Aggregate {
            sensor,
            target_sensor,
            aggregation,
            ..
        } => aggregate_members(ctx, &source, sensor, target, target_sensor, *aggregation),
    };
    Ok(handle)
}

fn attach_policy(
    ctx: &OrchestrationContext,
    entity: &Arc<Entity>,
    spec: &PolicySpec,
) -> LaunchResult<PolicyHandle> {
    Ok(AutoscalerPolicy::from_spec(spec)?.attach(ctx, entity)?)
}

/// Reject enricher wiring in which a sensor feeds back into itself.
fn check_enricher_graph(root: &EntitySpec) -> LaunchResult<()> {
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    collect_edges(root, &mut edges);

    // 0 = unvisited, 1 = on the current path, 2 = done
    let mut marks: BTreeMap<&str, u8> = BTreeMap::new();
    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, u8>,
        path: &mut Vec<&'a str>,
    ) -> Option<String> {
        match marks.get(node) {
            Some(2) => return None,
            Some(1) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Some(cycle.join(" -> "));
            }
            _ => {}
        }
        marks.insert(node, 1);
        path.push(node);
        for next in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(next, edges, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(node, 2);
        None
    }

    for node in edges.keys() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(node, &edges, &mut marks, &mut path) {
            return Err(LaunchError::EnricherCycle(cycle));
        }
    }
    Ok(())
}

fn collect_edges(spec: &EntitySpec, edges: &mut BTreeMap<String, BTreeSet<String>>) {
    let target = spec.display_name();
    let mut edge = |from: &str, sensor: &str, to_sensor: &str| {
        edges
            .entry(format!("{from}:{sensor}"))
            .or_default()
            .insert(format!("{target}:{to_sensor}"));
    };
    for enricher in &spec.enrichers {
        let source = enricher.source().unwrap_or(target);
        match enricher {
            EnricherSpec::Propagate { sensors, .. } => {
                for sensor in sensors {
                    edge(source, sensor, sensor);
                }
            }
            EnricherSpec::Transform {
                sensor,
                target_sensor,
                ..
            } => edge(source, sensor, target_sensor.as_deref().unwrap_or(sensor)),
            EnricherSpec::RollingMean {
                sensor,
                target_sensor,
                ..
            } => edge(source, sensor, target_sensor),
            // reads members, not a named entity
            EnricherSpec::Aggregate { .. } => {}
        }
    }
    for child in &spec.children {
        collect_edges(child, edges);
    }
}

/// Creates group members from a topology member template, named
/// `<group>-<index>`.
struct TemplateFactory {
    template: EntitySpec,
}

impl TemplateFactory {
    fn wire(&self, ctx: &OrchestrationContext, member: &Arc<Entity>) -> LaunchResult<()> {
        bind_dependent(ctx, member, &self.template)?;
        // Member subscriptions are dropped when the member is unmanaged.
        for enricher in &self.template.enrichers {
            attach_enricher(ctx, member, enricher)?;
        }
        for policy in &self.template.policies {
            attach_policy(ctx, member, policy)?;
        }
        Ok(())
    }
}

impl MemberFactory for TemplateFactory {
    fn create(
        &self,
        ctx: &OrchestrationContext,
        group: &Arc<Entity>,
        index: u32,
    ) -> EntityResult<Arc<Entity>> {
        let name = format!("{}-{index}", group.name());
        let member = instantiate(ctx, &self.template, &name).map_err(|e| member_error(&name, e))?;
        if let Err(e) = self.wire(ctx, &member) {
            ctx.unmanage(&member);
            return Err(member_error(&name, e));
        }
        Ok(member)
    }
}

fn member_error(name: &str, err: LaunchError) -> EntityError {
    match err {
        LaunchError::Entity(e) => e,
        other => EntityError::Start {
            entity: name.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiergrid_core::SensorRef;
    use tiergrid_entity::Lifecycle;

    fn topology(root: EntitySpec) -> TopologySpec {
        TopologySpec {
            name: None,
            launch: Default::default(),
            root,
        }
    }

    #[tokio::test]
    async fn builds_unstarted_tree() {
        let ctx = OrchestrationContext::new();
        let spec = topology(
            EntitySpec::new("application")
                .named("app")
                .child(EntitySpec::new("database-node").named("db"))
                .child(
                    EntitySpec::new("dynamic-cluster")
                        .named("web")
                        .configure("initial.size", json!(3))
                        .with_member(EntitySpec::new("web-server")),
                ),
        );
        let built = build_tree(&ctx, &spec).unwrap();
        assert_eq!(built.root.name(), "app");
        assert_eq!(built.root.children().len(), 2);
        assert_eq!(ctx.entities().len(), 3);
        assert!(ctx.entities().iter().all(|e| e.lifecycle() == Lifecycle::Created));
        let web = ctx.find("web").unwrap();
        assert_eq!(web.config_value("initial.size"), Some(json!(3)));
    }

    #[tokio::test]
    async fn dependent_config_waits_for_sensor() {
        let ctx = OrchestrationContext::new();
        let spec = topology(
            EntitySpec::new("application")
                .named("app")
                .child(EntitySpec::new("basic").named("db"))
                .child(EntitySpec::new("basic").named("web").configure(
                    "db.url",
                    ConfigValueSpec::Format {
                        format: "jdbc:{}visitors".to_string(),
                        args: vec![ConfigValueSpec::WhenReady {
                            when_ready: SensorRef {
                                entity: "db".to_string(),
                                sensor: "datastore.url".to_string(),
                            },
                        }],
                    },
                )),
        );
        build_tree(&ctx, &spec).unwrap();
        let db = ctx.find("db").unwrap();
        let web = ctx.find("web").unwrap();
        assert_eq!(web.config_value("db.url"), None);

        db.set_sensor_value("datastore.url", json!("mysql://127.0.0.1:3306/"));
        assert_eq!(
            web.config_value("db.url"),
            Some(json!("jdbc:mysql://127.0.0.1:3306/visitors"))
        );
    }

    #[test]
    fn unknown_type_names_the_entity() {
        let ctx = OrchestrationContext::new();
        let spec = topology(EntitySpec::new("application").child(EntitySpec::new("nginx").named("lb")));
        match build_tree(&ctx, &spec) {
            Err(LaunchError::UnknownType { entity, entity_type }) => {
                assert_eq!(entity, "lb");
                assert_eq!(entity_type, "nginx");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn cluster_without_member_is_rejected() {
        let ctx = OrchestrationContext::new();
        let spec = topology(EntitySpec::new("dynamic-cluster").named("web"));
        assert!(matches!(
            build_tree(&ctx, &spec),
            Err(LaunchError::InvalidTopology { .. })
        ));
    }

    #[test]
    fn enricher_cycles_are_rejected() {
        let ctx = OrchestrationContext::new();
        let spec = topology(
            EntitySpec::new("application")
                .named("app")
                .enricher(EnricherSpec::Propagate {
                    source: "web".to_string(),
                    sensors: vec!["load".to_string()],
                })
                .child(EntitySpec::new("basic").named("web").enricher(EnricherSpec::Transform {
                    source: "app".to_string(),
                    sensor: "load".to_string(),
                    target_sensor: None,
                    transform: "identity".to_string(),
                })),
        );
        match build_tree(&ctx, &spec) {
            Err(LaunchError::EnricherCycle(path)) => {
                assert!(path.contains("app:load") && path.contains("web:load"));
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
        assert!(ctx.entities().is_empty());
    }

    #[test]
    fn chained_enrichers_are_not_a_cycle() {
        let root = EntitySpec::new("application")
            .named("app")
            .enricher(EnricherSpec::Propagate {
                source: "web".to_string(),
                sensors: vec!["main.uri".to_string()],
            })
            .child(EntitySpec::new("basic").named("web").enricher(EnricherSpec::RollingMean {
                source: None,
                sensor: "reqs".to_string(),
                target_sensor: "reqs.windowed".to_string(),
                window: "10s".to_string(),
            }));
        assert!(check_enricher_graph(&root).is_ok());
    }

    #[tokio::test]
    async fn template_factory_wires_member_enrichers() {
        let ctx = OrchestrationContext::new();
        let spec = topology(
            EntitySpec::new("dynamic-cluster")
                .named("web")
                .configure("initial.size", json!(0))
                .with_member(EntitySpec::new("basic").enricher(EnricherSpec::Transform {
                    source: "ignored".to_string(),
                    sensor: "reqs".to_string(),
                    target_sensor: Some("reqs.n".to_string()),
                    transform: "to_number".to_string(),
                })),
        );
        // member template enrichers may not name another source
        assert!(build_tree(&ctx, &spec).is_err());

        let ctx = OrchestrationContext::new();
        let factory = TemplateFactory {
            template: EntitySpec::new("basic").enricher(EnricherSpec::RollingMean {
                source: None,
                sensor: "reqs".to_string(),
                target_sensor: "reqs.windowed".to_string(),
                window: "1m".to_string(),
            }),
        };
        let group = ctx
            .create_entity(tiergrid_entity::EntityBlueprint::new("dynamic-cluster").named("web"))
            .unwrap();
        let member = factory.create(&ctx, &group, 1).unwrap();
        assert_eq!(member.name(), "web-1");
        member.set_sensor_value("reqs", json!(4));
        assert_eq!(member.sensor_value("reqs.windowed"), Some(json!(4.0)));
    }
}
