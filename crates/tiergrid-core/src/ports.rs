//! Port ranges as written in topology files.
//!
//! ```text
//! "8080"       → exactly 8080
//! "8080+"      → 8080 up to 65535
//! "8080-8090"  → 8080 through 8090 inclusive
//! ```

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("invalid port range: {0:?}")]
    Invalid(String),
    #[error("empty port range: {0}-{1}")]
    Empty(u16, u16),
}

/// Inclusive range of TCP ports an entity may be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start > end {
            return Err(PortRangeError::Empty(start, end));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    /// `start` and every port above it: `8080+`.
    pub fn open(start: u16) -> Self {
        Self {
            start,
            end: u16::MAX,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Read a port range from a configuration value (string or integer).
    pub fn from_value(value: &Value) -> Result<Self, PortRangeError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Number(n) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .map(Self::single)
                .ok_or_else(|| PortRangeError::Invalid(n.to_string())),
            other => Err(PortRangeError::Invalid(other.to_string())),
        }
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| PortRangeError::Invalid(s.to_string()))
        };

        if let Some(start) = s.strip_suffix('+') {
            Ok(Self::open(port(start)?))
        } else if let Some((start, end)) = s.split_once('-') {
            Self::new(port(start)?, port(end)?)
        } else {
            Ok(Self::single(port(s)?))
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else if self.end == u16::MAX {
            write!(f, "{}+", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

// Serialised in its written form so it can be held as a config value.
impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}
