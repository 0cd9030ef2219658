//! Human-friendly duration strings (`500ms`, `30s`, `5m`, `1h`).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration: {0:?}")]
pub struct DurationError(pub String);

/// Parse a duration such as `"30s"`. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    let err = || DurationError(s.to_string());

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().map_err(|_| err())?;

    let secs_per = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(err()),
    };
    n.checked_mul(secs_per)
        .map(Duration::from_secs)
        .ok_or_else(err)
}
