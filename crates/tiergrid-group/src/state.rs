//! The group state machine value published as `group.state`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tiergrid_entity::Sensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GroupState {
    Empty,
    Stable { size: u32 },
    Resizing { from: u32, to: u32 },
}

impl GroupState {
    pub fn is_resizing(&self) -> bool {
        matches!(self, GroupState::Resizing { .. })
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Empty => f.write_str("empty"),
            GroupState::Stable { size } => write!(f, "stable({size})"),
            GroupState::Resizing { from, to } => write!(f, "resizing({from} -> {to})"),
        }
    }
}

pub const GROUP_STATE: Sensor<GroupState> = Sensor::new("group.state", "Group state machine");
