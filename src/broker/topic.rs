//! Topic identity
//!
//! A `Topic` names one parameterized feed instance as
//! `"<feed-type>:<canonical-json>"`. The canonical form sorts object keys at
//! every depth, renders `null` (and therefore absent `Option` fields) as the
//! empty string and carries no whitespace, so requests that mean the same
//! thing always land on the same topic no matter how the client ordered its
//! keys.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::utils::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Derive the topic for `params` published under `feed`.
    pub fn new<P: Serialize + ?Sized>(feed: &str, params: &P) -> Result<Self, EngineError> {
        let value = serde_json::to_value(params).map_err(|source| EngineError::Canonicalize {
            feed: feed.to_string(),
            source,
        })?;
        Ok(Self(format!("{feed}:{}", canonical_json(&value))))
    }

    /// The feed type this topic belongs to.
    pub fn feed_type(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(feed, _)| feed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Render `value` in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("\"\""),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // a JSON string value always serializes
    out.push_str(&Value::String(s.to_owned()).to_string());
}
