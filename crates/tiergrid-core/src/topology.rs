//! Topology file parser.
//!
//! A topology describes an entity tree declaratively:
//!
//! ```toml
//! name = "web-cluster-database"
//!
//! [launch]
//! location = "localhost"
//!
//! [root]
//! type = "application"
//! name = "app"
//!
//! [[root.children]]
//! type = "database-node"
//! name = "mysql"
//!
//! [[root.children]]
//! type = "dynamic-cluster"
//! name = "web"
//! config = { "initial.size" = 2, "db.url" = { when_ready = { entity = "mysql", sensor = "datastore.url" } } }
//! ```
//!
//! Configuration values are literals, `when_ready` references to another
//! entity's sensor, or `format` templates combining both.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::{Aggregation, MetricRange, SensorRef};

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("failed to parse topology: {0}")]
    Parse(String),

    #[error("duplicate entity name: {0}")]
    DuplicateName(String),

    #[error("entity {from:?} references unknown entity {reference:?}")]
    UnknownEntity { reference: String, from: String },

    #[error("invalid enricher on {entity:?}: {reason}")]
    InvalidEnricher { entity: String, reason: String },

    #[error("invalid policy on {entity:?}: {reason}")]
    InvalidPolicy { entity: String, reason: String },
}

/// A whole topology file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologySpec {
    /// Display name of the application.
    pub name: Option<String>,
    /// Launch defaults, overridable from the command line.
    #[serde(default)]
    pub launch: LaunchSection,
    /// The root of the entity tree.
    pub root: EntitySpec,
}

/// Defaults for `tierd launch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LaunchSection {
    pub location: Option<String>,
    pub port: Option<String>,
}

/// One node of the entity tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpec {
    /// Entity type tag, resolved against the catalog.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Name used for display and for references from other entities.
    pub name: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigValueSpec>,
    #[serde(default)]
    pub children: Vec<EntitySpec>,
    /// Template for the members of a group entity.
    pub member: Option<Box<EntitySpec>>,
    #[serde(default)]
    pub enrichers: Vec<EnricherSpec>,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

/// A configuration value as written in a topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigValueSpec {
    /// The value of a sensor once it becomes ready.
    WhenReady { when_ready: SensorRef },
    /// A `{}` template filled from literal and pending arguments.
    Format {
        format: String,
        args: Vec<ConfigValueSpec>,
    },
    Literal(serde_json::Value),
}

/// Enrichers declared on an entity; the declaring entity is the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EnricherSpec {
    /// Republish a set of sensors of `source` under the same names.
    Propagate { source: String, sensors: Vec<String> },
    /// Republish one sensor of `source` through a named transform.
    Transform {
        source: String,
        sensor: String,
        target_sensor: Option<String>,
        #[serde(default = "default_transform")]
        transform: String,
    },
    /// Mean of a numeric sensor over a sliding time window.
    RollingMean {
        source: Option<String>,
        sensor: String,
        target_sensor: String,
        window: String,
    },
    /// Fold a sensor across the members of a group.
    Aggregate {
        source: Option<String>,
        sensor: String,
        target_sensor: String,
        aggregation: Aggregation,
    },
}

/// Policies declared on an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicySpec {
    Autoscaler {
        metric: String,
        metric_range: (f64, f64),
        #[serde(default = "default_cooldown")]
        cooldown: String,
    },
}

fn default_transform() -> String {
    "identity".to_string()
}

fn default_cooldown() -> String {
    "0s".to_string()
}

impl TopologySpec {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let spec = Self::from_toml_str(&content)?;
        Ok(spec)
    }

    /// Parse and validate a topology.
    pub fn from_toml_str(content: &str) -> Result<Self, TopologyError> {
        let spec: TopologySpec =
            toml::from_str(content).map_err(|e| TopologyError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Display name, falling back to the root entity's name.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.root.display_name())
    }

    /// Check name uniqueness, references, durations and ranges.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut names = HashSet::new();
        self.root.collect_names(&mut names)?;
        self.root.check(&names)
    }
}

impl EntitySpec {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            name: None,
            config: BTreeMap::new(),
            children: Vec::new(),
            member: None,
            enrichers: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn configure(mut self, key: &str, value: impl Into<ConfigValueSpec>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn child(mut self, child: EntitySpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_member(mut self, member: EntitySpec) -> Self {
        self.member = Some(Box::new(member));
        self
    }

    pub fn enricher(mut self, enricher: EnricherSpec) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn policy(mut self, policy: PolicySpec) -> Self {
        self.policies.push(policy);
        self
    }

    /// Name if given, otherwise the type tag.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.entity_type)
    }

    // Member templates are instantiated many times, so their names are
    // not addressable from the rest of the tree.
    fn collect_names(&self, names: &mut HashSet<String>) -> Result<(), TopologyError> {
        let name = self.display_name().to_string();
        if !names.insert(name.clone()) {
            return Err(TopologyError::DuplicateName(name));
        }
        for child in &self.children {
            child.collect_names(names)?;
        }
        Ok(())
    }

    fn check(&self, names: &HashSet<String>) -> Result<(), TopologyError> {
        let me = self.display_name();
        let known = |reference: &str| -> Result<(), TopologyError> {
            if names.contains(reference) {
                Ok(())
            } else {
                Err(TopologyError::UnknownEntity {
                    reference: reference.to_string(),
                    from: me.to_string(),
                })
            }
        };

        for value in self.config.values() {
            for r in value.references() {
                known(&r.entity)?;
            }
        }

        for enricher in &self.enrichers {
            if let Some(source) = enricher.source() {
                known(source)?;
            }
            enricher.check(me)?;
        }

        for policy in &self.policies {
            policy.check(me)?;
        }

        for child in &self.children {
            child.check(names)?;
        }
        if let Some(member) = &self.member {
            member.check_template(me, names)?;
        }
        Ok(())
    }

    fn check_template(&self, group: &str, names: &HashSet<String>) -> Result<(), TopologyError> {
        for value in self.config.values() {
            if let Some(r) = value.references().into_iter().find(|r| !names.contains(&r.entity)) {
                return Err(TopologyError::UnknownEntity {
                    reference: r.entity.clone(),
                    from: format!("{group} member"),
                });
            }
        }
        for enricher in &self.enrichers {
            if enricher.source().is_some() {
                return Err(TopologyError::InvalidEnricher {
                    entity: group.to_string(),
                    reason: "member template enrichers may only read the member itself"
                        .to_string(),
                });
            }
            enricher.check(group)?;
        }
        for policy in &self.policies {
            policy.check(group)?;
        }
        Ok(())
    }
}

impl ConfigValueSpec {
    /// Every sensor reference this value waits on.
    pub fn references(&self) -> Vec<&SensorRef> {
        match self {
            ConfigValueSpec::WhenReady { when_ready } => vec![when_ready],
            ConfigValueSpec::Format { args, .. } => {
                args.iter().flat_map(|a| a.references()).collect()
            }
            ConfigValueSpec::Literal(_) => Vec::new(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, ConfigValueSpec::Literal(_))
    }
}

impl From<serde_json::Value> for ConfigValueSpec {
    fn from(value: serde_json::Value) -> Self {
        ConfigValueSpec::Literal(value)
    }
}

impl From<&str> for ConfigValueSpec {
    fn from(value: &str) -> Self {
        ConfigValueSpec::Literal(serde_json::Value::String(value.to_string()))
    }
}

impl EnricherSpec {
    /// The named source entity, if the enricher reads from another entity.
    pub fn source(&self) -> Option<&str> {
        match self {
            EnricherSpec::Propagate { source, .. } | EnricherSpec::Transform { source, .. } => {
                Some(source)
            }
            EnricherSpec::RollingMean { source, .. } | EnricherSpec::Aggregate { source, .. } => {
                source.as_deref()
            }
        }
    }

    fn check(&self, entity: &str) -> Result<(), TopologyError> {
        let invalid = |reason: String| TopologyError::InvalidEnricher {
            entity: entity.to_string(),
            reason,
        };
        match self {
            EnricherSpec::RollingMean { window, .. } => {
                parse_duration(window).map_err(|e| invalid(e.to_string()))?;
            }
            EnricherSpec::Propagate { sensors, .. } if sensors.is_empty() => {
                return Err(invalid("propagate enricher lists no sensors".to_string()));
            }
            _ => {}
        }
        Ok(())
    }
}

impl PolicySpec {
    fn check(&self, entity: &str) -> Result<(), TopologyError> {
        let invalid = |reason: String| TopologyError::InvalidPolicy {
            entity: entity.to_string(),
            reason,
        };
        match self {
            PolicySpec::Autoscaler {
                metric_range,
                cooldown,
                ..
            } => {
                let range = MetricRange::new(metric_range.0, metric_range.1);
                if !range.is_valid() {
                    return Err(invalid(format!(
                        "metric range [{}, {}] is empty",
                        range.lower, range.upper
                    )));
                }
                parse_duration(cooldown).map_err(|e| invalid(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationSpec;
    use serde_json::json;

    const WEB_CLUSTER: &str = r#"
name = "web-cluster-database"

[launch]
location = "localhost"
port = "8081+"

[root]
type = "application"
name = "app"

[[root.enrichers]]
kind = "propagate"
source = "web"
sensors = ["main.uri"]

[[root.enrichers]]
kind = "transform"
source = "web"
sensor = "group.size"
target_sensor = "appservers.count"

[[root.children]]
type = "database-node"
name = "mysql"
config = { "creation.script.url" = "classpath://visitors-creation-script.sql" }

[[root.children]]
type = "dynamic-cluster"
name = "web"

[root.children.config]
"initial.size" = 2
"db.url" = { format = "{}/{}", args = [{ when_ready = { entity = "mysql", sensor = "datastore.url" } }, "visitors"] }

[root.children.member]
type = "web-server"

[[root.children.policies]]
kind = "autoscaler"
metric = "http.requests.per_second.windowed.per_node"
metric_range = [10.0, 100.0]
cooldown = "5s"
"#;

    #[test]
    fn parse_web_cluster_topology() {
        let spec = TopologySpec::from_toml_str(WEB_CLUSTER).unwrap();
        assert_eq!(spec.display_name(), "web-cluster-database");
        assert_eq!(spec.launch.location.as_deref(), Some("localhost"));
        assert_eq!(spec.root.children.len(), 2);
        assert_eq!(spec.root.enrichers.len(), 2);

        let web = &spec.root.children[1];
        assert_eq!(web.member.as_ref().unwrap().entity_type, "web-server");
        assert_eq!(
            web.config["initial.size"],
            ConfigValueSpec::Literal(json!(2))
        );
        let refs = web.config["db.url"].references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].entity, "mysql");

        match &spec.root.enrichers[1] {
            EnricherSpec::Transform { transform, .. } => assert_eq!(transform, "identity"),
            other => panic!("unexpected enricher: {other:?}"),
        }
        match &web.policies[0] {
            PolicySpec::Autoscaler { metric_range, .. } => {
                assert_eq!(*metric_range, (10.0, 100.0))
            }
        }
    }

    #[test]
    fn rejects_unknown_reference() {
        let toml = r#"
[root]
type = "application"

[[root.children]]
type = "basic"
name = "web"
config = { "db.url" = { when_ready = { entity = "nope", sensor = "url" } } }
"#;
        let err = TopologySpec::from_toml_str(toml).unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnknownEntity {
                reference: "nope".to_string(),
                from: "web".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_reference_in_member_template() {
        let toml = r#"
[root]
type = "application"

[[root.children]]
type = "database-node"
name = "mysql"

[[root.children]]
type = "dynamic-cluster"
name = "web"

[root.children.member]
type = "web-server"
config = { "db.url" = { format = "jdbc:{}", args = [{ when_ready = { entity = "mysq", sensor = "datastore.url" } }] } }
"#;
        let err = TopologySpec::from_toml_str(toml).unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnknownEntity {
                reference: "mysq".to_string(),
                from: "web member".to_string()
            }
        );

        let fixed = toml.replace(r#"entity = "mysq""#, r#"entity = "mysql""#);
        assert!(TopologySpec::from_toml_str(&fixed).is_ok());
    }

    #[test]
    fn rejects_bad_window_in_member_template() {
        let spec = TopologySpec {
            name: None,
            launch: LaunchSection::default(),
            root: EntitySpec::new("dynamic-cluster").named("web").with_member(
                EntitySpec::new("web-server").enricher(EnricherSpec::RollingMean {
                    source: None,
                    sensor: "load".to_string(),
                    target_sensor: "load.windowed".to_string(),
                    window: "99999999999999999999h".to_string(),
                }),
            ),
        };
        assert!(matches!(
            spec.validate(),
            Err(TopologyError::InvalidEnricher { entity, .. }) if entity == "web"
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let spec = TopologySpec {
            name: None,
            launch: LaunchSection::default(),
            root: EntitySpec::new("application")
                .child(EntitySpec::new("basic").named("a"))
                .child(EntitySpec::new("basic").named("a")),
        };
        assert_eq!(
            spec.validate(),
            Err(TopologyError::DuplicateName("a".to_string()))
        );
    }

    #[test]
    fn rejects_empty_metric_range() {
        let spec = TopologySpec {
            name: None,
            launch: LaunchSection::default(),
            root: EntitySpec::new("dynamic-cluster").policy(PolicySpec::Autoscaler {
                metric: "load".to_string(),
                metric_range: (100.0, 10.0),
                cooldown: "0s".to_string(),
            }),
        };
        assert!(matches!(
            spec.validate(),
            Err(TopologyError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn rejects_bad_window() {
        let spec = TopologySpec {
            name: None,
            launch: LaunchSection::default(),
            root: EntitySpec::new("basic").enricher(EnricherSpec::RollingMean {
                source: None,
                sensor: "load".to_string(),
                target_sensor: "load.windowed".to_string(),
                window: "forever".to_string(),
            }),
        };
        assert!(matches!(
            spec.validate(),
            Err(TopologyError::InvalidEnricher { .. })
        ));
    }

    #[test]
    fn builder_round_trips_through_toml() {
        let spec = TopologySpec {
            name: Some("single-web-server".to_string()),
            launch: LaunchSection::default(),
            root: EntitySpec::new("application").child(
                EntitySpec::new("web-server")
                    .named("web")
                    .configure("war", "classpath://hello-world-webapp.war")
                    .configure("http.port", "8080+"),
            ),
        };
        let text = spec.to_toml_string().unwrap();
        let parsed = TopologySpec::from_toml_str(&text).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn from_file_reads_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.toml");
        std::fs::write(&path, WEB_CLUSTER).unwrap();
        let spec = TopologySpec::from_file(&path).unwrap();
        assert_eq!(spec.root.display_name(), "app");
    }

    #[test]
    fn demo_topologies_parse() {
        let demos = [
            include_str!("../../../demos/single-web-server.toml"),
            include_str!("../../../demos/web-cluster-database.toml"),
            include_str!("../../../demos/whirr-hadoop.toml"),
        ];
        let names: Vec<String> = demos
            .iter()
            .map(|text| TopologySpec::from_toml_str(text).unwrap().display_name().to_string())
            .collect();
        assert_eq!(
            names,
            ["single-web-server", "web-cluster-database", "whirr-hadoop"]
        );

        let hadoop = TopologySpec::from_toml_str(demos[2]).unwrap();
        let location = LocationSpec::parse(hadoop.launch.location.as_deref().unwrap()).unwrap();
        assert!(matches!(location, LocationSpec::Cloud { .. }));
        assert_eq!(hadoop.root.display_name(), "brooklyn-hadoop-example");
    }
}
