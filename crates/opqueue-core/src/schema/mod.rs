//! Operator input/output schemas and parameter validation.
//!
//! A schema is a tree of `Property` values. Operators build one in
//! `resolve_input`; the executor validates request params against it before
//! anything runs. The schema is plain serde data so it can also be stored in
//! an operation's metadata (`inputs_schema` / `outputs_schema`).

mod validation;

pub use validation::{ValidationError, ValidationFailure, validate};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The type (and type-specific constraints) of a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyType {
    String {
        #[serde(default)]
        allow_empty: bool,
    },
    Int {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Enum {
        values: Vec<Value>,
    },
    List {
        element: Box<PropertyType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_items: Option<usize>,
    },
    Object(ObjectSchema),
}

impl PropertyType {
    pub fn string() -> Self {
        PropertyType::String { allow_empty: false }
    }

    pub fn int() -> Self {
        PropertyType::Int {
            min: None,
            max: None,
        }
    }

    pub fn int_range(min: Option<i64>, max: Option<i64>) -> Self {
        PropertyType::Int { min, max }
    }

    pub fn float_range(min: Option<f64>, max: Option<f64>) -> Self {
        PropertyType::Float { min, max }
    }

    pub fn enumeration<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        PropertyType::Enum {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn list_of(element: PropertyType) -> Self {
        PropertyType::List {
            element: Box::new(element),
            min_items: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::String { .. } => "string",
            PropertyType::Int { .. } => "int",
            PropertyType::Float { .. } => "float",
            PropertyType::Boolean => "boolean",
            PropertyType::Enum { .. } => "enum",
            PropertyType::List { .. } => "list",
            PropertyType::Object(_) => "object",
        }
    }
}

/// A named slot in an object schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(flatten)]
    pub kind: PropertyType,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Property {
    pub fn new(kind: PropertyType) -> Self {
        Self {
            kind,
            required: false,
            label: None,
            description: None,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Properties of an object, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, property: Property) -> Self {
        self.properties.insert(name.into(), property);
        self
    }

    /// Convenience for the common "required, non-empty string" slot.
    pub fn str(self, name: impl Into<String>, required: bool) -> Self {
        let property = Property::new(PropertyType::string());
        self.property(name, if required { property.required() } else { property })
    }

    /// Wrap as the root property of an input/output schema.
    pub fn into_property(self) -> Property {
        Property::new(PropertyType::Object(self)).required()
    }
}
