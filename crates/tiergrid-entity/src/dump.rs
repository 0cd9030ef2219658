//! Human-readable and serialisable dumps of a live entity tree.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde::Serialize;
use serde_json::Value;

use crate::entity::Entity;
use crate::types::{EntityId, Lifecycle};

/// Point-in-time view of an entity and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub state: Lifecycle,
    pub config: BTreeMap<String, Value>,
    pub sensors: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeSnapshot>,
}

impl TreeSnapshot {
    pub fn capture(entity: &Entity) -> Self {
        Self {
            id: entity.id(),
            name: entity.name().to_string(),
            entity_type: entity.entity_type().to_string(),
            state: entity.lifecycle(),
            config: entity.own_config(),
            sensors: entity.sensors(),
            children: entity
                .children()
                .iter()
                .map(|c| TreeSnapshot::capture(c))
                .collect(),
        }
    }

    /// Number of entities in the snapshot.
    pub fn entity_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TreeSnapshot::entity_count)
            .sum::<usize>()
    }

    /// Depth-first search by name.
    pub fn find(&self, name: &str) -> Option<&TreeSnapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    fn render(&self, out: &mut String, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        writeln!(
            out,
            "{pad}{} ({}) [{}] {}",
            self.name, self.id, self.entity_type, self.state
        )?;
        for (key, value) in &self.config {
            writeln!(out, "{pad}  config {key} = {value}")?;
        }
        for (name, value) in &self.sensors {
            writeln!(out, "{pad}  sensor {name} = {value}")?;
        }
        for child in &self.children {
            child.render(out, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for TreeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out, 0)?;
        f.write_str(&out)
    }
}
