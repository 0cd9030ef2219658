//! Shared types used across tiergrid crates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a sensor on a named entity of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRef {
    /// Name of the entity in the topology.
    pub entity: String,
    /// Sensor name on that entity.
    pub sensor: String,
}

/// How an aggregating enricher folds member values into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Mean,
    Min,
    Max,
    /// Every member's value, oldest member first. Not numeric.
    List,
}

impl Aggregation {
    /// Fold a set of numeric samples. Returns `None` for an empty set and
    /// for `List`.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let folded = match self {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::List => return None,
        };
        Some(folded)
    }

    /// The value to publish for a set of member values.
    ///
    /// Numeric folds skip non-numeric values. With nothing left to fold
    /// `Sum` gives 0 and the others give `null`, so a stale result never
    /// outlives the members it came from.
    pub fn fold(self, values: &[Value]) -> Value {
        if self == Aggregation::List {
            return Value::Array(values.to_vec());
        }
        let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
        match self.apply(&numbers) {
            Some(folded) => Value::from(folded),
            None if self == Aggregation::Sum => Value::from(0.0),
            None => Value::Null,
        }
    }
}

/// Inclusive bounds on the number of members of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: u32,
    pub max: u32,
}

impl SizeRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Clamp a requested size into the range.
    pub fn clamp(&self, size: u32) -> u32 {
        size.clamp(self.min, self.max.max(self.min))
    }

    pub fn contains(&self, size: u32) -> bool {
        size >= self.min && size <= self.max
    }
}

/// Acceptable band for a metric observed by an autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub lower: f64,
    pub upper: f64,
}

impl MetricRange {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Midpoint of the band, the value a resize aims for.
    pub fn midpoint(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }

    pub fn is_valid(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite() && self.lower < self.upper
    }
}
