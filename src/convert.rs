//! Conversion of raw URL strings into typed protobuf values, and assignment
//! of those values along a [`FieldPath`].

use crate::field_path::{FieldPath, FieldPathComponent};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use base64::Engine;
use prost::bytes::Bytes;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, Value};
use std::str::FromStr;
use thiserror::Error;

/// Why a raw string could not be stored in a field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{0}")]
    Mismatch(String),

    #[error("unknown enum value {value:?} for {enum_name}")]
    UnknownEnum { enum_name: String, value: String },
}

/// Parse a single value for `field`, ignoring its cardinality.
pub fn parse_field_value(field: &FieldDescriptor, raw: &str) -> Result<Value, ConvertError> {
    parse_kind(&field.kind(), raw)
}

/// Parse a single value of the given kind.
pub fn parse_kind(kind: &Kind, raw: &str) -> Result<Value, ConvertError> {
    let mismatch = |ty: &str, err: &dyn std::fmt::Display| {
        ConvertError::Mismatch(format!("parsing {raw:?} as {ty}: {err}"))
    };

    let value = match kind {
        Kind::Bool => Value::Bool(parse_bool(raw).ok_or_else(|| {
            ConvertError::Mismatch(format!("parsing {raw:?} as bool: invalid syntax"))
        })?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(raw.parse().map_err(|e| mismatch("int32", &e))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(raw.parse().map_err(|e| mismatch("int64", &e))?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            Value::U32(raw.parse().map_err(|e| mismatch("uint32", &e))?)
        }
        Kind::Uint64 | Kind::Fixed64 => {
            Value::U64(raw.parse().map_err(|e| mismatch("uint64", &e))?)
        }
        Kind::Float => Value::F32(raw.parse().map_err(|e| mismatch("float", &e))?),
        Kind::Double => Value::F64(raw.parse().map_err(|e| mismatch("double", &e))?),
        Kind::String => Value::String(raw.to_string()),
        Kind::Bytes => {
            let decoded = BASE64
                .decode(raw)
                .or_else(|_| BASE64_URL.decode(raw))
                .map_err(|e| mismatch("bytes", &e))?;
            Value::Bytes(Bytes::from(decoded))
        }
        Kind::Enum(en) => {
            let number = match en.get_value_by_name(raw) {
                Some(value) => value.number(),
                None => raw
                    .parse::<i32>()
                    .ok()
                    .filter(|n| en.get_value(*n).is_some())
                    .ok_or_else(|| ConvertError::UnknownEnum {
                        enum_name: en.full_name().to_string(),
                        value: raw.to_string(),
                    })?,
            };
            Value::EnumNumber(number)
        }
        Kind::Message(msg) => Value::Message(parse_well_known(msg, raw)?),
    };

    Ok(value)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn parse_well_known(desc: &MessageDescriptor, raw: &str) -> Result<DynamicMessage, ConvertError> {
    let mut message = DynamicMessage::new(desc.clone());
    let transcode_err =
        |e: prost::DecodeError| ConvertError::Mismatch(format!("{}: {e}", desc.full_name()));

    match desc.full_name() {
        "google.protobuf.Timestamp" => {
            let ts = prost_types::Timestamp::from_str(raw).map_err(|e| {
                ConvertError::Mismatch(format!("parsing {raw:?} as timestamp: {e}"))
            })?;
            message.transcode_from(&ts).map_err(transcode_err)?;
        }
        "google.protobuf.Duration" => {
            let duration = prost_types::Duration::from_str(raw).map_err(|e| {
                ConvertError::Mismatch(format!("parsing {raw:?} as duration: {e}"))
            })?;
            message.transcode_from(&duration).map_err(transcode_err)?;
        }
        "google.protobuf.FieldMask" => {
            let mask = prost_types::FieldMask {
                paths: raw
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect(),
            };
            message.transcode_from(&mask).map_err(transcode_err)?;
        }
        name if name.starts_with("google.protobuf.") && name.ends_with("Value") => {
            let inner = desc.get_field_by_name("value").ok_or_else(|| {
                ConvertError::Mismatch(format!("{name} cannot be populated from a string"))
            })?;
            let value = parse_field_value(&inner, raw)?;
            message.set_field(&inner, value);
        }
        name => {
            return Err(ConvertError::Mismatch(format!(
                "message {name} cannot be populated from a string"
            )))
        }
    }

    Ok(message)
}

/// Walk `parents` from `root`, creating intermediate messages on demand.
pub fn message_at_mut<'a>(
    root: &'a mut DynamicMessage,
    parents: &[FieldPathComponent],
) -> Result<&'a mut DynamicMessage, ConvertError> {
    let mut current = root;
    for component in parents {
        current = current
            .get_field_mut(&component.target)
            .as_message_mut()
            .ok_or_else(|| {
                ConvertError::Mismatch(format!("{} is not a message field", component.name))
            })?;
    }
    Ok(current)
}

/// Store `raw` values at `path`. Repeated leaves take every value in order;
/// singular leaves require exactly one.
pub fn populate_field(
    root: &mut DynamicMessage,
    path: &FieldPath,
    raw: &[&str],
) -> Result<(), ConvertError> {
    let leaf = path
        .leaf()
        .ok_or_else(|| ConvertError::Mismatch("cannot populate the whole message".into()))?;
    let field = &leaf.target;

    let value = if field.is_list() {
        let items = raw
            .iter()
            .map(|r| parse_field_value(field, r))
            .collect::<Result<Vec<_>, _>>()?;
        Value::List(items)
    } else {
        match raw {
            [single] => parse_field_value(field, single)?,
            [] => return Err(ConvertError::Mismatch(format!("no value for {path}"))),
            _ => {
                return Err(ConvertError::Mismatch(format!(
                    "too many values for field {path}: {}",
                    raw.join(", ")
                )))
            }
        }
    };

    let parent = message_at_mut(root, path.parents())?;
    parent.set_field(field, value);
    Ok(())
}

/// Insert one `key => value` entry into the map field at `path`.
pub fn insert_map_entry(
    root: &mut DynamicMessage,
    path: &FieldPath,
    key: &str,
    raw: &str,
) -> Result<(), ConvertError> {
    let leaf = path
        .leaf()
        .ok_or_else(|| ConvertError::Mismatch("cannot populate the whole message".into()))?;
    let field = &leaf.target;
    let Kind::Message(entry) = field.kind() else {
        return Err(ConvertError::Mismatch(format!("{path} is not a map field")));
    };
    if !field.is_map() {
        return Err(ConvertError::Mismatch(format!("{path} is not a map field")));
    }

    let map_key = parse_field_value(&entry.map_entry_key_field(), key)?
        .into_map_key()
        .ok_or_else(|| ConvertError::Mismatch(format!("invalid map key {key:?} for {path}")))?;
    let value = parse_field_value(&entry.map_entry_value_field(), raw)?;

    let parent = message_at_mut(root, path.parents())?;
    let map = parent
        .get_field_mut(field)
        .as_map_mut()
        .ok_or_else(|| ConvertError::Mismatch(format!("{path} is not a map field")))?;
    map.insert(map_key, value);
    Ok(())
}
