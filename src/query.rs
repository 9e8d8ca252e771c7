//! Query parameter discovery and query-string population.

use crate::convert::{insert_map_entry, populate_field, ConvertError};
use crate::error::{Error, Result};
use crate::field_path::{
    is_map_with_scalar_values, is_proto3_optional, is_scalar_message, FieldPath,
};
use crate::trie::FieldPathTrie;
use prost_reflect::{DynamicMessage, Kind, MessageDescriptor};
use std::collections::HashMap;
use tracing::debug;

/// A query key and the request field it populates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameter {
    pub name: String,
    pub path: FieldPath,
}

/// An explicitly named query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryAlias {
    pub name: String,
    pub path: FieldPath,
    /// False when the name merely repeats the selector
    pub is_custom_name: bool,
}

/// Explicit query settings of one binding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameterCustomization {
    pub ignored_fields: Vec<FieldPath>,
    pub aliases: Vec<QueryAlias>,
    pub disable_auto_discovery: bool,
}

/// Walk `root` and list every field reachable as a query parameter.
///
/// Fields are visited depth first in declaration order. Anything `claimed`
/// covers (under its proto or JSON name) is skipped together with its
/// subtree. Singular messages are descended into; repeated messages, maps
/// with message values and message types already on the current branch
/// are not reachable from a query string.
pub fn discover(root: &MessageDescriptor, claimed: &FieldPathTrie) -> Vec<QueryParameter> {
    let mut out = Vec::new();
    let mut ancestors = vec![root.full_name().to_string()];
    walk(root, &FieldPath::root(), claimed, &mut ancestors, &mut out);
    out
}

fn walk(
    desc: &MessageDescriptor,
    prefix: &FieldPath,
    claimed: &FieldPathTrie,
    ancestors: &mut Vec<String>,
    out: &mut Vec<QueryParameter>,
) {
    for field in desc.fields() {
        let path = prefix.child(field.clone());
        let selector = path.selector();
        if claimed.has_common_prefix(&selector) || claimed.has_common_prefix(&path.json_selector())
        {
            continue;
        }

        if field.is_map() {
            if is_map_with_scalar_values(&field) {
                out.push(QueryParameter {
                    name: selector,
                    path,
                });
            }
            continue;
        }

        match field.kind() {
            Kind::Message(msg) if !is_scalar_message(&msg) => {
                if field.is_list() || ancestors.iter().any(|a| a == msg.full_name()) {
                    continue;
                }
                ancestors.push(msg.full_name().to_string());
                walk(&msg, &path, claimed, ancestors, out);
                ancestors.pop();
            }
            _ => out.push(QueryParameter {
                name: selector,
                path,
            }),
        }
    }
}

/// The final query parameter set of a binding, indexed by every accepted key
#[derive(Debug, Clone, Default)]
pub struct QueryTable {
    parameters: Vec<QueryParameter>,
    by_key: HashMap<String, usize>,
}

impl QueryTable {
    /// Index `parameters` by name, proto selector and JSON selector. Earlier
    /// entries win when two parameters answer to the same key.
    pub fn new(parameters: Vec<QueryParameter>) -> Self {
        let mut by_key = HashMap::new();
        for (idx, param) in parameters.iter().enumerate() {
            for key in [
                param.name.clone(),
                param.path.selector(),
                param.path.json_selector(),
            ] {
                by_key.entry(key).or_insert(idx);
            }
        }
        Self { parameters, by_key }
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Look up a parameter by query key
    pub fn get(&self, key: &str) -> Option<&QueryParameter> {
        self.by_key.get(key).map(|idx| &self.parameters[*idx])
    }

    /// Apply a raw (still percent-encoded) query string to `message`.
    ///
    /// Repeated keys fill repeated fields in order; `name[key]=value` fills
    /// map parameters. Keys that are unknown, or whose field is already
    /// `claimed` by the body or a path variable, are ignored.
    pub fn populate(
        &self,
        message: &mut DynamicMessage,
        query: &str,
        claimed: &FieldPathTrie,
    ) -> Result<()> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match grouped.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value.into_owned()),
                None => grouped.push((key.into_owned(), vec![value.into_owned()])),
            }
        }

        // oneof full name -> member already populated from the query
        let mut oneofs: HashMap<String, String> = HashMap::new();
        for (key, values) in &grouped {
            let (base, map_key) = split_map_key(key);
            let Some(param) = self.get(base) else {
                debug!(key = %key, "ignoring unknown query parameter");
                continue;
            };
            if claimed.has_common_prefix(&param.path.selector()) {
                debug!(key = %key, "ignoring query parameter claimed by body or path");
                continue;
            }

            for component in param.path.components() {
                let field = &component.target;
                let Some(oneof) = field.containing_oneof() else {
                    continue;
                };
                if is_proto3_optional(field) {
                    continue;
                }
                let member = oneofs
                    .entry(oneof.full_name().to_string())
                    .or_insert_with(|| field.full_name().to_string());
                if member.as_str() != field.full_name() {
                    return Err(Error::InvalidQueryParameters(format!(
                        "{key}: field already set for oneof {:?}",
                        oneof.name()
                    )));
                }
            }

            let is_map = param.path.leaf().is_some_and(|l| l.target.is_map());
            let result = match (map_key, is_map) {
                (Some(map_key), true) => values
                    .iter()
                    .try_for_each(|v| insert_map_entry(message, &param.path, map_key, v)),
                (None, false) => {
                    let raw: Vec<&str> = values.iter().map(String::as_str).collect();
                    populate_field(message, &param.path, &raw)
                }
                (Some(_), false) => Err(ConvertError::Mismatch(format!(
                    "{base} is not a map field"
                ))),
                (None, true) => Err(ConvertError::Mismatch(format!(
                    "map field {base} expects {base}[key]=value"
                ))),
            };
            result.map_err(|e| Error::InvalidQueryParameters(format!("{key}: {e}")))?;
        }

        Ok(())
    }
}

/// Split `name[key]` into `("name", Some("key"))`
fn split_map_key(key: &str) -> (&str, Option<&str>) {
    match key.strip_suffix(']').and_then(|k| k.split_once('[')) {
        Some((base, map_key)) if !base.is_empty() => (base, Some(map_key)),
        _ => (key, None),
    }
}
