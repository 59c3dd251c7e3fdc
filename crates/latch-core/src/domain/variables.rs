//! Typed process variables.
//!
//! Handlers only ever see a closed set of value kinds. The engine's
//! typed-value wire form (`{"value": .., "type": "String"}`) is converted
//! here, and anything outside the closed set is rejected at the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::LatchError;

/// A single variable value.
///
/// `Integer` and `Double` together form the "number" kind.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Null,
}

impl VariableValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariableValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VariableValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VariableValue::Integer(n) => Some(*n as f64),
            VariableValue::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VariableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, VariableValue::Null)
    }

    /// Engine type name used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::String(_) => "String",
            VariableValue::Integer(n) if i32::try_from(*n).is_ok() => "Integer",
            VariableValue::Integer(_) => "Long",
            VariableValue::Double(_) => "Double",
            VariableValue::Boolean(_) => "Boolean",
            VariableValue::Null => "Null",
        }
    }

    fn to_wire(&self) -> Value {
        let value = match self {
            VariableValue::String(s) => Value::String(s.clone()),
            VariableValue::Integer(n) => json!(n),
            VariableValue::Double(n) => json!(n),
            VariableValue::Boolean(b) => Value::Bool(*b),
            VariableValue::Null => Value::Null,
        };
        json!({ "value": value, "type": self.type_name() })
    }

    fn from_wire(name: &str, wire: WireValue) -> Result<Self, LatchError> {
        let invalid = |reason: String| LatchError::InvalidVariable {
            name: name.to_string(),
            reason,
        };

        let declared = wire.kind.as_deref().map(str::to_ascii_lowercase);
        match (declared.as_deref(), wire.value) {
            (Some("null"), _) | (None, Value::Null) => Ok(VariableValue::Null),
            (Some("string"), Value::String(s)) | (None, Value::String(s)) => {
                Ok(VariableValue::String(s))
            }
            (Some("boolean"), Value::Bool(b)) | (None, Value::Bool(b)) => {
                Ok(VariableValue::Boolean(b))
            }
            (Some("integer" | "long" | "short"), Value::Number(n)) => n
                .as_i64()
                .map(VariableValue::Integer)
                .ok_or_else(|| invalid(format!("{n} is not an integer"))),
            (Some("double"), Value::Number(n)) => n
                .as_f64()
                .map(VariableValue::Double)
                .ok_or_else(|| invalid(format!("{n} is not a double"))),
            (None, Value::Number(n)) => Ok(n
                .as_i64()
                .map(VariableValue::Integer)
                .unwrap_or_else(|| VariableValue::Double(n.as_f64().unwrap_or(f64::NAN)))),
            // 型宣言付きの null は値なしとして扱う
            (Some("string" | "boolean" | "integer" | "long" | "short" | "double"), Value::Null) => {
                Ok(VariableValue::Null)
            }
            (Some(other), value) => Err(invalid(format!(
                "unsupported value of type {other}: {value}"
            ))),
            (None, value) => Err(invalid(format!("unsupported value {value}"))),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::String(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<i32> for VariableValue {
    fn from(value: i32) -> Self {
        VariableValue::Integer(value.into())
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Double(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Boolean(value)
    }
}

impl<T: Into<VariableValue>> From<Option<T>> for VariableValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(VariableValue::Null)
    }
}

/// Engine typed-value as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireValue {
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Name → value mapping passed to and from handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables(BTreeMap<String, VariableValue>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<VariableValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(VariableValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Engine wire form: `{"name": {"value": .., "type": ..}}`.
    pub fn to_wire(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), value.to_wire()))
            .collect()
    }

    /// Parse the engine wire form.
    ///
    /// Valid entries are returned as `Variables`; every rejected entry is
    /// returned as an error next to them so the caller can log it.
    pub(crate) fn from_wire(wire: BTreeMap<String, WireValue>) -> (Self, Vec<LatchError>) {
        let mut vars = Variables::new();
        let mut rejected = Vec::new();
        for (name, raw) in wire {
            match VariableValue::from_wire(&name, raw) {
                Ok(value) => {
                    vars.0.insert(name, value);
                }
                Err(e) => rejected.push(e),
            }
        }
        (vars, rejected)
    }
}

impl<K: Into<String>, V: Into<VariableValue>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Variables::new();
        for (k, v) in iter {
            vars.insert(k, v);
        }
        vars
    }
}
