// Self-describing document value model.
//
// Values round-trip through JSON for the log payloads and per-document
// files. Timestamps have no native JSON form and travel as a single-field
// object `{"$ts": "<rfc3339>"}`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tolerance for numeric deep equality.
const NUMERIC_EPSILON: f64 = 1e-4;

/// Tag used to encode timestamps inside JSON.
const TIMESTAMP_TAG: &str = "$ts";

/// A single field value inside a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric coercion used by the increment operator. Accepts integers,
    /// floats, and numeric strings.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// True when the value is numeric after coercion.
    pub fn is_numeric(&self) -> bool {
        self.as_number().is_some()
    }

    /// Converts to the JSON representation used on disk and in log payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::json!({
                TIMESTAMP_TAG: ts.to_rfc3339_opts(SecondsFormat::Millis, true)
            }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(out)
            }
        }
    }

    /// Parses the JSON representation back into a value.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(raw)) = map.get(TIMESTAMP_TAG) {
                        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
                            return Value::Timestamp(ts.with_timezone(&Utc));
                        }
                    }
                }
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(out)
            }
        }
    }

    /// Deep equality used by the pull operator: numerically equal within
    /// 1e-4, structurally equal, or equal string renderings.
    pub fn deep_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return (a - b).abs() < NUMERIC_EPSILON;
        }
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.deep_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.deep_eq(vb))
            }
            _ => self == other || self.render() == other.render(),
        }
    }

    /// Canonical string rendering, used as the equality fallback and in
    /// duplicate-key diagnostics.
    pub fn render(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            other => other.to_json().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_json_round_trip() {
        let mut obj = BTreeMap::new();
        obj.insert("n".to_string(), Value::Int(42));
        obj.insert("f".to_string(), Value::Float(2.5));
        obj.insert(
            "when".to_string(),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
        );
        obj.insert(
            "tags".to_string(),
            Value::Array(vec![Value::from("a"), Value::Null]),
        );
        let original = Value::Object(obj);

        let json = original.to_json();
        assert_eq!(Value::from_json(&json), original);
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int(3).as_number(), Some(3.0));
        assert_eq!(Value::from(" 2.5 ").as_number(), Some(2.5));
        assert_eq!(Value::Bool(true).as_number(), None);
    }

    #[test]
    fn test_deep_eq_numeric_tolerance() {
        assert!(Value::Float(1.00001).deep_eq(&Value::Int(1)));
        assert!(!Value::Float(1.001).deep_eq(&Value::Int(1)));
        assert!(Value::from("5").deep_eq(&Value::Int(5)));
    }

    #[test]
    fn test_deep_eq_structural() {
        let a = Value::Array(vec![Value::Int(1), Value::from("x")]);
        let b = Value::Array(vec![Value::Float(1.0), Value::from("x")]);
        assert!(a.deep_eq(&b));
    }
}
