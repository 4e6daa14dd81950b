//! State forms: raw (persisted) and typed (decoded), plus the tagged
//! known/unknown value model.
//!
//! An attribute value is either [`AttrValue::Known`] or
//! [`AttrValue::Unknown`] ("known only after apply"). Unknown is a distinct
//! tagged state, not a sentinel, so it can never be confused with a
//! legitimate null or empty value. Because payloads cross the wire as JSON,
//! Unknown is encoded as the single-key object `{"$hemmer.unknown": true}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::schema::Schema;
use crate::validation;

/// The JSON wire marker for an unknown value.
pub const UNKNOWN_MARKER_KEY: &str = "$hemmer.unknown";

/// An attribute value that is either known now or known only after apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A concrete value.
    Known(Value),
    /// A value the provider will only produce during apply.
    Unknown,
}

impl AttrValue {
    /// Wrap a concrete value.
    pub fn known(value: impl Into<Value>) -> Self {
        Self::Known(value.into())
    }

    /// Whether this value is still pending apply.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// The concrete value, if known.
    pub fn as_known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    /// Decode a wire value, recognizing the unknown marker.
    pub fn from_wire(value: Value) -> Self {
        if Self::is_unknown_marker(&value) {
            Self::Unknown
        } else {
            Self::Known(value)
        }
    }

    /// Encode for the wire, producing the unknown marker when pending.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Known(v) => v.clone(),
            Self::Unknown => serde_json::json!({ UNKNOWN_MARKER_KEY: true }),
        }
    }

    /// Whether a wire value is the unknown marker object.
    pub fn is_unknown_marker(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                map.len() == 1 && map.get(UNKNOWN_MARKER_KEY) == Some(&Value::Bool(true))
            },
            _ => false,
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttrValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_wire(Value::deserialize(deserializer)?))
    }
}

/// Persisted resource state: an opaque value tagged with the schema version
/// it was written under. Meaningless without its tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawState {
    /// The schema version the state was written under.
    pub version: u64,
    /// The stored value.
    pub state: Value,
}

impl RawState {
    /// Create a raw state from a version tag and value.
    pub fn new(version: u64, state: Value) -> Self {
        Self { version, state }
    }
}

/// Resource state decoded and validated against the current schema. This is
/// the only form lifecycle operations other than upgrade may consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedState {
    /// The schema version this state conforms to.
    pub version: u64,
    /// Attribute values, keyed by attribute name.
    pub values: BTreeMap<String, AttrValue>,
}

impl TypedState {
    /// Decode a wire value against a schema.
    ///
    /// Fails if the value is not an object, mentions an attribute the schema
    /// does not declare, omits a required attribute, or carries a known value
    /// of the wrong type. Unknown-marked values pass every type check: they
    /// are resolved at apply time.
    pub fn decode(schema: &Schema, value: &Value) -> Result<Self, ProtocolError> {
        let obj = match value {
            Value::Object(map) => map,
            other => {
                return Err(ProtocolError::Validation(format!(
                    "expected object state, got {}",
                    validation::value_type_name(other)
                )))
            },
        };

        let mut values = BTreeMap::new();
        for (name, raw) in obj {
            if schema.attribute(name).is_none() {
                return Err(ProtocolError::Validation(format!(
                    "attribute '{}' is not declared in the schema",
                    name
                )));
            }
            values.insert(name.clone(), AttrValue::from_wire(raw.clone()));
        }

        for name in schema.required_attributes() {
            if !values.contains_key(name) {
                return Err(ProtocolError::Validation(format!(
                    "required attribute '{}' is missing from state",
                    name
                )));
            }
        }

        let mut diagnostics = Vec::new();
        for (name, attr_value) in &values {
            if let AttrValue::Known(v) = attr_value {
                // Safe: every key was checked against the schema above.
                if let Some(attr) = schema.attribute(name) {
                    validation::check_attr_type(&attr.attr_type, v, name, &mut diagnostics);
                }
            }
        }
        if let Some(first) = diagnostics.first() {
            return Err(ProtocolError::Validation(first.summary.clone()));
        }

        Ok(Self {
            version: schema.version,
            values,
        })
    }

    /// Re-encode to the wire form, with unknown markers for pending values.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, v)| (name.clone(), v.to_wire()))
                .collect(),
        )
    }

    /// Look up an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    /// Look up a known attribute value; `None` if absent or unknown.
    pub fn known(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(AttrValue::as_known)
    }

    /// Whether every attribute value is concrete.
    pub fn is_fully_known(&self) -> bool {
        self.values.values().all(|v| !v.is_unknown())
    }
}
