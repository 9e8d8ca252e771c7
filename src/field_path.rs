//! Field path resolution against a message schema.
//!
//! Selectors are resolved lazily, one hop at a time by field name, so
//! recursive message definitions never need to be materialized.

use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor};
use std::fmt;
use thiserror::Error;

/// Well-known message types that travel as a single scalar value in URLs.
const SCALAR_MESSAGES: &[&str] = &[
    "google.protobuf.DoubleValue",
    "google.protobuf.FloatValue",
    "google.protobuf.Int64Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.Int32Value",
    "google.protobuf.UInt32Value",
    "google.protobuf.BoolValue",
    "google.protobuf.StringValue",
    "google.protobuf.BytesValue",
    "google.protobuf.Timestamp",
    "google.protobuf.Duration",
    "google.protobuf.FieldMask",
];

/// Field path resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("field not found: {field:?} in message {message}")]
    NotFound { field: String, message: String },

    #[error("not an aggregate type: {field:?} in {selector:?}")]
    NotAggregate { field: String, selector: String },

    #[error("optional field not allowed in field path: {field:?} in {selector:?}")]
    OptionalNotAllowed { field: String, selector: String },

    #[error("field path {selector:?} must end in a scalar or enum field, found {found}")]
    NotScalar { selector: String, found: String },
}

/// One hop of a [`FieldPath`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPathComponent {
    pub name: String,
    pub target: FieldDescriptor,
}

/// Ordered list of fields leading from a root message to a (possibly
/// nested) value. The empty path denotes the whole message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    components: Vec<FieldPathComponent>,
}

impl FieldPath {
    /// The empty path, addressing the root message itself
    pub fn root() -> Self {
        Self::default()
    }

    /// Resolve a dotted selector against `root`. Each name is looked up as a
    /// proto field name first and then as a JSON name; components always
    /// carry the proto name. The empty string resolves to the empty path.
    pub fn resolve(root: &MessageDescriptor, selector: &str) -> Result<Self, FieldPathError> {
        let mut components = Vec::new();
        if selector.is_empty() {
            return Ok(Self { components });
        }

        let mut current = root.clone();
        let names: Vec<&str> = selector.split('.').collect();
        for (idx, name) in names.iter().enumerate() {
            let field = current
                .get_field_by_name(name)
                .or_else(|| current.get_field_by_json_name(name))
                .ok_or_else(|| FieldPathError::NotFound {
                    field: name.to_string(),
                    message: current.full_name().to_string(),
                })?;

            if idx + 1 < names.len() {
                current = match field.kind() {
                    Kind::Message(next) if !field.is_list() && !field.is_map() => next,
                    _ => {
                        return Err(FieldPathError::NotAggregate {
                            field: name.to_string(),
                            selector: selector.to_string(),
                        })
                    }
                };
            }

            components.push(FieldPathComponent {
                name: field.name().to_string(),
                target: field,
            });
        }

        Ok(Self { components })
    }

    /// Resolve a selector used as a path template variable. Proto3
    /// `optional` fields are rejected anywhere along the path, and the
    /// leaf must be a scalar, enum or scalar-equivalent message.
    pub fn resolve_path_parameter(
        root: &MessageDescriptor,
        selector: &str,
    ) -> Result<Self, FieldPathError> {
        let path = Self::resolve(root, selector)?;
        if let Some(component) = path.components.iter().find(|c| is_proto3_optional(&c.target)) {
            return Err(FieldPathError::OptionalNotAllowed {
                field: component.name.clone(),
                selector: selector.to_string(),
            });
        }
        path.check_scalar_leaf(false)?;
        Ok(path)
    }

    /// Extend this path by one field
    pub fn child(&self, field: FieldDescriptor) -> Self {
        let mut components = self.components.clone();
        components.push(FieldPathComponent {
            name: field.name().to_string(),
            target: field,
        });
        Self { components }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> &[FieldPathComponent] {
        &self.components
    }

    /// The terminal component, if any
    pub fn leaf(&self) -> Option<&FieldPathComponent> {
        self.components.last()
    }

    /// Every component except the terminal one
    pub fn parents(&self) -> &[FieldPathComponent] {
        match self.components.split_last() {
            Some((_, parents)) => parents,
            None => &[],
        }
    }

    /// Dotted proto field names, e.g. `note_details.text`
    pub fn selector(&self) -> String {
        self.join(|c| c.name.as_str())
    }

    /// Dotted JSON field names, e.g. `noteDetails.text`
    pub fn json_selector(&self) -> String {
        self.join(|c| c.target.json_name())
    }

    fn join<'a>(&'a self, name: impl Fn(&'a FieldPathComponent) -> &'a str) -> String {
        self.components.iter().map(name).collect::<Vec<_>>().join(".")
    }

    /// Verify the leaf can be populated from a single URL string value.
    ///
    /// Scalars, enums and scalar-equivalent well-known messages are always
    /// accepted (repeated ones included). Maps with scalar values are
    /// accepted only when `allow_map` is set, as one aggregate parameter.
    pub fn check_scalar_leaf(&self, allow_map: bool) -> Result<(), FieldPathError> {
        let Some(leaf) = self.leaf() else {
            return Err(FieldPathError::NotScalar {
                selector: String::new(),
                found: "the whole message".to_string(),
            });
        };

        let field = &leaf.target;
        if field.is_map() {
            if allow_map && is_map_with_scalar_values(field) {
                return Ok(());
            }
            return Err(FieldPathError::NotScalar {
                selector: self.selector(),
                found: "map".to_string(),
            });
        }

        match field.kind() {
            Kind::Message(msg) if !is_scalar_message(&msg) => Err(FieldPathError::NotScalar {
                selector: self.selector(),
                found: format!("message {}", msg.full_name()),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector())
    }
}

/// Whether `field` was declared with the proto3 `optional` keyword
pub fn is_proto3_optional(field: &FieldDescriptor) -> bool {
    field.field_descriptor_proto().proto3_optional()
}

/// Whether `desc` is a well-known message that encodes as one scalar
pub fn is_scalar_message(desc: &MessageDescriptor) -> bool {
    SCALAR_MESSAGES.contains(&desc.full_name())
}

/// Whether a single URL value can populate `field` (scalar, enum, or a
/// scalar-equivalent message), ignoring cardinality
pub fn is_scalar_like(field: &FieldDescriptor) -> bool {
    match field.kind() {
        Kind::Message(msg) => is_scalar_message(&msg),
        _ => true,
    }
}

/// Whether `field` is a map whose values are scalar-like
pub fn is_map_with_scalar_values(field: &FieldDescriptor) -> bool {
    if !field.is_map() {
        return false;
    }
    match field.kind() {
        Kind::Message(entry) => is_scalar_like(&entry.map_entry_value_field()),
        _ => false,
    }
}
