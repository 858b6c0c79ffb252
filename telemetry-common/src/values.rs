use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Device-reported fields, keyed by field name.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Closed set of value kinds a device can report. Serialized untagged, so a
/// `FieldMap` reads and writes as a plain JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<FieldValue>),
    Map(FieldMap),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// JSON type name, as used in validation error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "number",
            FieldValue::String(_) => "string",
            FieldValue::List(_) => "array",
            FieldValue::Map(_) => "object",
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                // u64 above i64::MAX and floats both land here
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => FieldValue::String(s),
            Value::Array(items) => FieldValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => FieldValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Integer(i) => Value::Number(i.into()),
            FieldValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            FieldValue::String(s) => Value::String(s),
            FieldValue::List(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            FieldValue::Map(map) => Value::Object(fields_to_json_map(map)),
        }
    }
}

pub fn fields_to_json_map(fields: FieldMap) -> serde_json::Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| (key, value.into()))
        .collect()
}

pub fn fields_to_json(fields: FieldMap) -> Value {
    Value::Object(fields_to_json_map(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_json_object() {
        let value: FieldValue = json!({
            "temperature": 21.5,
            "count": 3,
            "ok": true,
            "label": "north",
            "readings": [1, 2.5],
            "position": {"lat": 48.85}
        })
        .into();

        let FieldValue::Map(map) = value else {
            panic!("expected a map");
        };
        assert_eq!(map["temperature"], FieldValue::Float(21.5));
        assert_eq!(map["count"], FieldValue::Integer(3));
        assert_eq!(map["ok"], FieldValue::Bool(true));
        assert_eq!(map["label"], FieldValue::String("north".to_owned()));
        assert_eq!(
            map["readings"],
            FieldValue::List(vec![FieldValue::Integer(1), FieldValue::Float(2.5)])
        );
        assert_eq!(map["position"].kind_name(), "object");
    }

    #[test]
    fn serializes_untagged() {
        let mut fields = FieldMap::new();
        fields.insert("humidity".to_owned(), FieldValue::Integer(40));
        fields.insert("mode".to_owned(), FieldValue::String("eco".to_owned()));

        let encoded = serde_json::to_value(&fields).unwrap();
        assert_eq!(encoded, json!({"humidity": 40, "mode": "eco"}));

        let decoded: FieldMap = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn integer_stays_integer() {
        // untagged deserialization tries Integer before Float
        let decoded: FieldValue = serde_json::from_str("7").unwrap();
        assert_eq!(decoded, FieldValue::Integer(7));
        assert_eq!(decoded.as_f64(), Some(7.0));
    }
}
