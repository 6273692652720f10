//! Bounded rendering of job arguments for flow metadata
//!
//! Arguments are described as a `LoggableValue` tree and rendered to JSON by
//! a visitor that caps every level: strings at `MAX_STRING_CHARS` characters
//! plus `"..."`, lists at `MAX_LIST_ITEMS` elements and maps at
//! `MAX_MAP_KEYS` keys. Anything that cannot be represented as JSON becomes
//! `UNSERIALIZABLE_MARKER`.

use serde_json::Value;
use thiserror::Error;

pub const MAX_STRING_CHARS: usize = 100;
pub const MAX_LIST_ITEMS: usize = 3;
pub const MAX_MAP_KEYS: usize = 5;
pub const UNSERIALIZABLE_MARKER: &str = "[unserializable]";

const ELLIPSIS: &str = "...";

/// Argument value as seen by the tracking layer
#[derive(Debug, Clone, PartialEq)]
pub enum LoggableValue {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    List(Vec<LoggableValue>),
    /// Keys keep their insertion order.
    Map(Vec<(String, LoggableValue)>),
    /// A value with no JSON form; carries its type name for diagnostics.
    Opaque(String),
}

#[derive(Debug, Error)]
#[error("value of type {0} cannot be represented")]
struct UnserializableValue(String);

impl LoggableValue {
    pub fn opaque<T: ?Sized>() -> Self {
        LoggableValue::Opaque(std::any::type_name::<T>().to_string())
    }

    /// Render with all limits applied.
    pub fn truncated(&self) -> Value {
        truncate(self)
    }
}

impl From<Value> for LoggableValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => LoggableValue::Null,
            Value::Bool(b) => LoggableValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => LoggableValue::Int(i),
                None => n
                    .as_f64()
                    .map(LoggableValue::Number)
                    .unwrap_or_else(|| LoggableValue::Str(n.to_string())),
            },
            Value::String(s) => LoggableValue::Str(s),
            Value::Array(items) => LoggableValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                LoggableValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for LoggableValue {
    fn from(s: &str) -> Self {
        LoggableValue::Str(s.to_string())
    }
}

impl From<String> for LoggableValue {
    fn from(s: String) -> Self {
        LoggableValue::Str(s)
    }
}

impl From<i64> for LoggableValue {
    fn from(i: i64) -> Self {
        LoggableValue::Int(i)
    }
}

impl From<f64> for LoggableValue {
    fn from(n: f64) -> Self {
        LoggableValue::Number(n)
    }
}

impl From<bool> for LoggableValue {
    fn from(b: bool) -> Self {
        LoggableValue::Bool(b)
    }
}

/// Render `value` to JSON with all limits applied.
pub fn truncate(value: &LoggableValue) -> Value {
    Truncator.visit(value)
}

/// Truncate a plain string to `MAX_STRING_CHARS` characters plus `"..."`.
pub fn truncate_str(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_STRING_CHARS).collect();
    out.push_str(ELLIPSIS);
    out
}

struct Truncator;

impl Truncator {
    /// Render one node; a node that fails is replaced by the marker without
    /// affecting its siblings.
    fn visit(&self, value: &LoggableValue) -> Value {
        self.try_visit(value)
            .unwrap_or_else(|_| Value::String(UNSERIALIZABLE_MARKER.to_string()))
    }

    fn try_visit(&self, value: &LoggableValue) -> Result<Value, UnserializableValue> {
        Ok(match value {
            LoggableValue::Null => Value::Null,
            LoggableValue::Bool(b) => Value::Bool(*b),
            LoggableValue::Int(i) => Value::from(*i),
            LoggableValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .ok_or_else(|| UnserializableValue(format!("f64 ({})", n)))?,
            LoggableValue::Str(s) => Value::String(truncate_str(s)),
            LoggableValue::List(items) => {
                Value::Array(items.iter().take(MAX_LIST_ITEMS).map(|v| self.visit(v)).collect())
            }
            LoggableValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .take(MAX_MAP_KEYS)
                    .map(|(k, v)| (k.clone(), self.visit(v)))
                    .collect(),
            ),
            LoggableValue::Opaque(type_name) => return Err(UnserializableValue(type_name.clone())),
        })
    }
}
