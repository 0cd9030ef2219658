//! `format_template` — interpolate literal and pending values into a string.
//!
//! Placeholders are `{}`, filled positionally. `{{` and `}}` are literal
//! braces. String arguments are inserted without quotes; any other JSON
//! value is inserted in its JSON form.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{DependentError, DependentResult};
use crate::pending::PendingValue;

/// One template argument.
#[derive(Debug, Clone)]
pub enum Resolvable {
    Literal(Value),
    Pending(PendingValue<Value>),
}

impl From<Value> for Resolvable {
    fn from(value: Value) -> Self {
        Resolvable::Literal(value)
    }
}

impl From<&str> for Resolvable {
    fn from(value: &str) -> Self {
        Resolvable::Literal(Value::String(value.to_string()))
    }
}

impl From<PendingValue<Value>> for Resolvable {
    fn from(value: PendingValue<Value>) -> Self {
        Resolvable::Pending(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Arg(usize),
}

fn parse(template: &str) -> DependentResult<Vec<Segment>> {
    let invalid = |reason: &str| DependentError::Template {
        template: template.to_string(),
        reason: reason.to_string(),
    };
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut args = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('{', Some('{')) | ('}', Some('}')) => {
                chars.next();
                text.push(c);
            }
            ('{', Some('}')) => {
                chars.next();
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Arg(args));
                args += 1;
            }
            ('{', _) => return Err(invalid("unclosed '{'")),
            ('}', _) => return Err(invalid("unmatched '}'")),
            _ => text.push(c),
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render(segments: &[Segment], values: &[Option<Value>]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Arg(i) => {
                if let Some(Some(value)) = values.get(*i) {
                    out.push_str(&render_arg(value));
                }
            }
        }
    }
    out
}

struct Progress {
    values: Vec<Option<Value>>,
    remaining: usize,
}

/// Compose `args` into `template`. The result resolves once every pending
/// argument has resolved; immediately if there are none.
pub fn format_template(
    template: &str,
    args: Vec<Resolvable>,
) -> DependentResult<PendingValue<String>> {
    let segments = parse(template)?;
    let expected = segments
        .iter()
        .filter(|s| matches!(s, Segment::Arg(_)))
        .count();
    if expected != args.len() {
        return Err(DependentError::Arity {
            template: template.to_string(),
            expected,
            got: args.len(),
        });
    }

    let result = PendingValue::new(format!("format({template})"));
    let mut values = Vec::with_capacity(args.len());
    let mut pending = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        match arg {
            Resolvable::Literal(v) => values.push(Some(v)),
            Resolvable::Pending(p) => {
                values.push(None);
                pending.push((i, p));
            }
        }
    }

    if pending.is_empty() {
        result.try_resolve(render(&segments, &values));
        return Ok(result);
    }

    let progress = Arc::new(Mutex::new(Progress {
        values,
        remaining: pending.len(),
    }));
    let segments = Arc::new(segments);
    for (i, input) in pending {
        let progress = Arc::clone(&progress);
        let segments = Arc::clone(&segments);
        let result = result.clone();
        input.on_resolved(move |value| {
            let rendered = {
                let mut progress = progress.lock();
                progress.values[i] = Some(value.clone());
                progress.remaining -= 1;
                (progress.remaining == 0).then(|| render(&segments, &progress.values))
            };
            if let Some(rendered) = rendered {
                result.try_resolve(rendered);
            }
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literals_resolve_immediately() {
        let s = format_template("{}:{}", vec!["host".into(), json!(8080).into()]).unwrap();
        assert_eq!(s.get().as_deref(), Some("host:8080"));
    }

    #[test]
    fn braces_escape() {
        let s = format_template("{{{}}}", vec!["x".into()]).unwrap();
        assert_eq!(s.get().as_deref(), Some("{x}"));
    }

    #[test]
    fn rejects_bad_templates() {
        assert!(matches!(
            format_template("{}{}", vec!["a".into()]),
            Err(DependentError::Arity {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(matches!(
            format_template("{oops", vec![]),
            Err(DependentError::Template { .. })
        ));
        assert!(matches!(
            format_template("a}b", vec![]),
            Err(DependentError::Template { .. })
        ));
    }

    #[test]
    fn resolves_when_every_input_has() {
        let url = PendingValue::new("url");
        let user = PendingValue::new("user");
        let s = format_template(
            "{}/visitors?user={}&password={}",
            vec![url.clone().into(), user.clone().into(), "br00k11n".into()],
        )
        .unwrap();

        url.try_resolve(json!("jdbc://10.0.0.5:3306"));
        assert_eq!(s.get(), None);
        user.try_resolve(json!("brooklyn"));
        assert_eq!(
            s.get().as_deref(),
            Some("jdbc://10.0.0.5:3306/visitors?user=brooklyn&password=br00k11n")
        );
    }

    #[test]
    fn same_input_twice() {
        let host = PendingValue::new("host");
        let s = format_template("{}-{}", vec![host.clone().into(), host.clone().into()]).unwrap();
        host.try_resolve(json!("a"));
        assert_eq!(s.get().as_deref(), Some("a-a"));
    }
}
