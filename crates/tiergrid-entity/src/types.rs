//! Identifiers, lifecycle states and capabilities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-unique entity identifier, allocated by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        }
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition(&self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Created, Starting)
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Stopping or stopped.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Lifecycle::Stopping | Lifecycle::Stopped)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities an entity may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Startable,
    Resizable,
    HasSensors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        use Lifecycle::*;
        let path = [Created, Starting, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn lifecycle_rejects_illegal_moves() {
        use Lifecycle::*;
        assert!(!Stopped.can_transition(Starting));
        assert!(!Created.can_transition(Running));
        assert!(!Stopped.can_transition(Failed));
        assert!(!Stopping.can_transition(Running));
        assert!(Running.can_transition(Failed));
    }

    #[test]
    fn entity_id_display() {
        assert_eq!(EntityId(7).to_string(), "e7");
        assert_eq!(serde_json::to_string(&EntityId(7)).unwrap(), "7");
    }
}
