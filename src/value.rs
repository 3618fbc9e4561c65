//! Tagged values for query parameters and result cells.
//!
//! [`Value`] replaces untyped JSON plumbing: parameters are checked here, at the
//! serialization boundary, so unsupported shapes (non-finite floats, empty map
//! keys) are rejected before a statement reaches the engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::BridgeError;

/// Parameters for Cypher queries, keyed by name without the `$` prefix.
///
/// Ordered so serialized payloads and log summaries are deterministic.
pub type Params = BTreeMap<String, Value>;

/// A dynamically typed value crossing the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name used in parameter summaries.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Checks that the value can be represented on the wire.
    ///
    /// `path` names the value in error messages (e.g. `$props.tags[2]`).
    pub fn validate(&self, path: &str) -> Result<(), BridgeError> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(BridgeError::validation(format!(
                "{} is a non-finite float ({}), which cannot be serialized",
                path, f
            ))),
            Value::List(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, v)| v.validate(&format!("{}[{}]", path, i))),
            Value::Map(map) => map.iter().try_for_each(|(k, v)| {
                if k.is_empty() {
                    return Err(BridgeError::validation(format!(
                        "{} contains an empty map key",
                        path
                    )));
                }
                v.validate(&format!("{}.{}", path, k))
            }),
            _ => Ok(()),
        }
    }

    /// Converts to a JSON value. Non-finite floats become `null`; call
    /// [`validate`](Value::validate) first when that matters.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Serializes to JSON text after validation.
    pub fn to_json_text(&self, path: &str) -> Result<String, BridgeError> {
        self.validate(path)?;
        serde_json::to_string(&self.to_json())
            .map_err(|e| BridgeError::validation(format!("failed to serialize {}: {}", path, e)))
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Checks every parameter name and value before anything is sent.
pub fn validate_params(params: &Params) -> Result<(), BridgeError> {
    for (name, value) in params {
        if name.is_empty() {
            return Err(BridgeError::validation("parameter names must not be empty"));
        }
        value.validate(&format!("${}", name))?;
    }
    Ok(())
}

/// Validates and serializes Cypher parameters into the JSON text AGE expects.
pub fn params_to_json(params: &Params) -> Result<String, BridgeError> {
    validate_params(params)?;
    let map: serde_json::Map<String, JsonValue> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::to_string(&map)
        .map_err(|e| BridgeError::validation(format!("failed to serialize parameters: {}", e)))
}

/// Summarizes named parameters for logs and error context: names and types only.
pub fn summarize_params(params: &Params) -> String {
    summarize(params.iter().map(|(k, v)| (format!("${}", k), v)))
}

/// Summarizes positional parameters for logs and error context.
pub fn summarize_positional(params: &[Value]) -> String {
    summarize(
        params
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("${}", i + 1), v)),
    )
}

fn summarize<'a>(items: impl ExactSizeIterator<Item = (String, &'a Value)>) -> String {
    const SHOWN: usize = 8;
    let total = items.len();
    if total == 0 {
        return String::new();
    }
    let mut parts: Vec<String> = items
        .take(SHOWN)
        .map(|(name, v)| format!("{}: {}", name, v.type_name()))
        .collect();
    if total > SHOWN {
        parts.push(format!("… {} more", total - SHOWN));
    }
    format!(
        "{} param{}: [{}]",
        total,
        if total == 1 { "" } else { "s" },
        parts.join(", ")
    )
}
