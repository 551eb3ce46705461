//! Recursive validation of request params against a schema.
//!
//! Problems are accumulated, not short-circuited, so a caller can show every
//! one of them at once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::{Property, PropertyType};

/// One problem at one path (`name`, `filter.min`, `tags[2]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

/// All problems found while validating one set of params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub struct ValidationFailure {
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.path.as_str()).collect()
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid params")?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", err.path, err.reason)?;
        }
        Ok(())
    }
}

/// Validate `params` against the root `schema`.
pub fn validate(schema: &Property, params: &Map<String, Value>) -> Result<(), ValidationFailure> {
    let mut errors = Vec::new();
    let root = Value::Object(params.clone());
    match &schema.kind {
        // The root is normally an object; its own path is empty.
        PropertyType::Object(object) => {
            for (name, property) in &object.properties {
                check_property(name.clone(), property, params.get(name), &mut errors);
            }
        }
        _ => check_property(String::new(), schema, Some(&root), &mut errors),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure { errors })
    }
}

fn check_property(
    path: String,
    property: &Property,
    value: Option<&Value>,
    errors: &mut Vec<ValidationError>,
) {
    let value = match value {
        None | Some(Value::Null) => {
            if property.required && property.default.is_none() {
                push(errors, path, "required property is missing");
            }
            return;
        }
        Some(v) => v,
    };

    if property.required
        && let (PropertyType::String { allow_empty: false }, Value::String(s)) =
            (&property.kind, value)
        && s.is_empty()
    {
        push(errors, path, "required property must not be empty");
        return;
    }

    check_value(path, &property.kind, value, errors);
}

fn check_value(path: String, kind: &PropertyType, value: &Value, errors: &mut Vec<ValidationError>) {
    match kind {
        PropertyType::String { .. } => {
            if !value.is_string() {
                push(errors, path, type_mismatch("string", value));
            }
        }
        PropertyType::Int { min, max } => match as_integer(value) {
            None => push(errors, path, type_mismatch("int", value)),
            Some(n) => {
                if let Some(min) = min
                    && n < *min
                {
                    push(errors, path, format!("{n} is less than the minimum {min}"));
                } else if let Some(max) = max
                    && n > *max
                {
                    push(errors, path, format!("{n} is greater than the maximum {max}"));
                }
            }
        },
        PropertyType::Float { min, max } => match value.as_f64() {
            None => push(errors, path, type_mismatch("float", value)),
            Some(x) => {
                if let Some(min) = min
                    && x < *min
                {
                    push(errors, path, format!("{x} is less than the minimum {min}"));
                } else if let Some(max) = max
                    && x > *max
                {
                    push(errors, path, format!("{x} is greater than the maximum {max}"));
                }
            }
        },
        PropertyType::Boolean => {
            if !value.is_boolean() {
                push(errors, path, type_mismatch("boolean", value));
            }
        }
        PropertyType::Enum { values } => {
            if !values.contains(value) {
                push(errors, path, format!("{value} is not one of the allowed values"));
            }
        }
        PropertyType::List { element, min_items } => match value.as_array() {
            None => push(errors, path, type_mismatch("list", value)),
            Some(items) => {
                if let Some(min) = min_items
                    && items.len() < *min
                {
                    push(
                        errors,
                        path.clone(),
                        format!("expected at least {min} items, got {}", items.len()),
                    );
                }
                for (i, item) in items.iter().enumerate() {
                    check_value(format!("{path}[{i}]"), element, item, errors);
                }
            }
        },
        PropertyType::Object(object) => match value.as_object() {
            None => push(errors, path, type_mismatch("object", value)),
            Some(map) => {
                for (name, property) in &object.properties {
                    check_property(join(&path, name), property, map.get(name), errors);
                }
            }
        },
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|x| x.fract() == 0.0 && x.is_finite())
            .map(|x| x as i64)
    })
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn type_mismatch(expected: &str, value: &Value) -> String {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    };
    format!("expected {expected}, got {actual}")
}

fn push(errors: &mut Vec<ValidationError>, path: String, reason: impl Into<String>) {
    errors.push(ValidationError {
        path,
        reason: reason.into(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ObjectSchema;
    use rstest::rstest;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn missing_required_name_is_exactly_one_error() {
        let schema = ObjectSchema::new().str("name", true).into_property();
        let failure = validate(&schema, &params(json!({}))).unwrap_err();
        assert_eq!(failure.paths(), vec!["name"]);
    }

    #[test]
    fn empty_required_string_is_rejected() {
        let schema = ObjectSchema::new().str("name", true).into_property();
        let failure = validate(&schema, &params(json!({"name": ""}))).unwrap_err();
        assert_eq!(failure.errors.len(), 1);
        assert!(failure.errors[0].reason.contains("empty"));
    }

    #[test]
    fn optional_missing_and_defaulted_properties_pass() {
        let schema = ObjectSchema::new()
            .str("note", false)
            .property(
                "format",
                Property::new(PropertyType::enumeration(["csv", "json"]))
                    .required()
                    .with_default(json!("csv")),
            )
            .into_property();
        assert!(validate(&schema, &params(json!({}))).is_ok());
    }

    #[rstest]
    #[case::in_range(json!(5), true)]
    #[case::at_min(json!(1), true)]
    #[case::below_min(json!(0), false)]
    #[case::above_max(json!(11), false)]
    #[case::wrong_type(json!("5"), false)]
    #[case::integral_float(json!(3.0), true)]
    #[case::fractional(json!(3.5), false)]
    fn int_bounds(#[case] value: Value, #[case] ok: bool) {
        let schema = ObjectSchema::new()
            .property(
                "n",
                Property::new(PropertyType::int_range(Some(1), Some(10))).required(),
            )
            .into_property();
        assert_eq!(validate(&schema, &params(json!({ "n": value }))).is_ok(), ok);
    }

    #[rstest]
    #[case::member(json!("json"), true)]
    #[case::not_member(json!("xml"), false)]
    fn enum_membership(#[case] value: Value, #[case] ok: bool) {
        let schema = ObjectSchema::new()
            .property("format", Property::new(PropertyType::enumeration(["csv", "json"])))
            .into_property();
        assert_eq!(validate(&schema, &params(json!({ "format": value }))).is_ok(), ok);
    }

    #[test]
    fn errors_accumulate_across_nested_objects_and_lists() {
        let schema = ObjectSchema::new()
            .str("name", true)
            .property(
                "tags",
                Property::new(PropertyType::list_of(PropertyType::string())),
            )
            .property(
                "limits",
                Property::new(PropertyType::Object(
                    ObjectSchema::new()
                        .property("max", Property::new(PropertyType::float_range(None, Some(1.0))))
                        .property("flag", Property::new(PropertyType::Boolean).required()),
                )),
            )
            .into_property();

        let failure = validate(
            &schema,
            &params(json!({
                "tags": ["a", 2, "c", false],
                "limits": {"max": 2.5}
            })),
        )
        .unwrap_err();

        assert_eq!(
            failure.paths(),
            vec!["limits.flag", "limits.max", "name", "tags[1]", "tags[3]"]
        );
    }

    #[test]
    fn list_min_items() {
        let schema = ObjectSchema::new()
            .property(
                "ids",
                Property::new(PropertyType::List {
                    element: Box::new(PropertyType::int()),
                    min_items: Some(1),
                }),
            )
            .into_property();
        let failure = validate(&schema, &params(json!({"ids": []}))).unwrap_err();
        assert_eq!(failure.paths(), vec!["ids"]);
    }

    #[test]
    fn display_lists_every_problem() {
        let failure = ValidationFailure {
            errors: vec![
                ValidationError {
                    path: "a".into(),
                    reason: "x".into(),
                },
                ValidationError {
                    path: "b".into(),
                    reason: "y".into(),
                },
            ],
        };
        assert_eq!(failure.to_string(), "invalid params: a: x; b: y");
    }

    #[test]
    fn schema_survives_a_metadata_round_trip() {
        let schema = ObjectSchema::new()
            .str("name", true)
            .property("n", Property::new(PropertyType::int_range(Some(0), None)))
            .into_property();
        let stored = serde_json::to_value(&schema).unwrap();
        assert_eq!(stored["type"], "object");
        let back: Property = serde_json::from_value(stored).unwrap();
        assert_eq!(back, schema);
    }
}
