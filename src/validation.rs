//! Configuration checking against declared schemas.
//!
//! This module validates `serde_json::Value` configuration against a
//! [`Schema`], producing diagnostics with dotted attribute paths. Values
//! carrying the unknown marker pass every type check: they are placeholders
//! resolved at apply time, and validating them is the apply's job.
//!
//! # Example
//!
//! ```
//! use hemmer_plugin_core::schema::{Schema, Attribute};
//! use hemmer_plugin_core::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute("count", Attribute::optional_int64());
//!
//! assert!(validate(&schema, &json!({"name": "db", "count": 3})).is_empty());
//!
//! let bad = validate(&schema, &json!({"name": "db", "count": "three"}));
//! assert_eq!(bad[0].attribute, Some("count".to_string()));
//! ```

use crate::diagnostics::{Diagnostic, Severity};
use crate::schema::{Attribute, AttributeType, Schema};
use crate::state::AttrValue;
use serde_json::Value;
use std::collections::HashMap;

/// Check a configuration value against a schema, collecting one diagnostic
/// per problem found; an empty result means the value conforms.
///
/// Required attributes must be present and non-null, optional ones may be
/// absent, and computed-only ones are ignored since the provider writes
/// them. Known values are type-checked; unknown-marked values pass for any
/// declared type.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return diagnostics,
        other => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(other))),
            );
            return diagnostics;
        },
    };

    for (name, attr) in &schema.attributes {
        validate_attribute(attr, obj.get(name.as_str()), name, &mut diagnostics);
    }

    for name in obj.keys() {
        if schema.attribute(name).is_none() {
            diagnostics.push(
                Diagnostic::error(format!("Unexpected attribute '{}'", name))
                    .with_detail("No such attribute is declared for this type")
                    .with_attribute(name.clone()),
            );
        }
    }

    diagnostics
}

/// [`validate`] in `Result` form, for call sites that want `?`.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Boolean form of [`validate`], discarding the diagnostics.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Computed-only attributes belong to the provider, not configuration.
    if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("A value must be supplied for this attribute")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => {
            check_attr_type(&attr.attr_type, v, path, diagnostics);
        },
    }
}

/// Type-check a known value against an attribute type, appending diagnostics
/// for mismatches. Unknown-marked values pass unconditionally.
pub(crate) fn check_attr_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if AttrValue::is_unknown_marker(value) {
        return;
    }

    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !value.is_number() {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) | AttributeType::Set(element_type) => {
            // Both arrive as JSON arrays on the wire.
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    check_attr_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                let expected = if matches!(attr_type, AttributeType::List(_)) {
                    "list"
                } else {
                    "set"
                };
                diagnostics.push(type_error(path, expected, value));
            }
        },
        AttributeType::Map(value_type) => {
            if let Some(obj) = value.as_object() {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    check_attr_type(value_type, val, &key_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "map", value));
            }
        },
        AttributeType::Object(attrs) => {
            if let Some(obj) = value.as_object() {
                check_object_type(attrs, obj, path, diagnostics);
            } else {
                diagnostics.push(type_error(path, "object", value));
            }
        },
        AttributeType::Dynamic => {},
    }
}

fn check_object_type(
    attrs: &HashMap<String, AttributeType>,
    obj: &serde_json::Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, attr_type) in attrs {
        let attr_path = format!("{}.{}", path, name);
        if let Some(value) = obj.get(name) {
            check_attr_type(attr_type, value, &attr_path, diagnostics);
        }
        // Object fields carry no presence flags, so a missing field is fine.
    }
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_some() {
                true
            } else if let Some(f) = n.as_f64() {
                // A float without a fractional part still counts
                f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64
            } else {
                false
            }
        },
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        summary: format!("Invalid type for attribute '{}'", path),
        detail: Some(format!(
            "Expected {}, got {}",
            expected,
            value_type_name(got)
        )),
        attribute: Some(path.to_string()),
    }
}
