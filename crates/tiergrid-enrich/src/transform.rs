//! Transform functions and the named transforms usable from topology files.

use std::sync::Arc;

use serde_json::{Number, Value};
use tiergrid_entity::is_ready;

use crate::error::{EnrichError, EnrichResult};

/// A pure function from one sensor value to another.
pub type TransformFn = Arc<dyn Fn(&Value) -> EnrichResult<Value> + Send + Sync>;

pub fn identity() -> TransformFn {
    Arc::new(|v| Ok(v.clone()))
}

/// Look up a transform by name: `identity`, `to_string`, `to_number`,
/// `is_truthy`.
pub fn named_transform(name: &str) -> EnrichResult<TransformFn> {
    let f: TransformFn = match name {
        "identity" => identity(),
        "to_string" => Arc::new(|v| {
            Ok(Value::String(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
        }),
        "to_number" => Arc::new(to_number),
        "is_truthy" => Arc::new(|v| Ok(Value::Bool(is_ready(v)))),
        other => return Err(EnrichError::UnknownTransform(other.to_string())),
    };
    Ok(f)
}

fn to_number(value: &Value) -> EnrichResult<Value> {
    let fail = |reason: String| EnrichError::Transform {
        transform: "to_number".into(),
        reason,
    };
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail(format!("{s:?} is not a number")))
        }
        other => Err(fail(format!("cannot convert {other} to a number"))),
    }
}
