//! Binding construction and the request-time binding table.
//!
//! Bindings are built once from endpoint specifications and never mutated
//! afterwards; the finished [`BindingTable`] is shared by every request.

use crate::convert::{populate_field, ConvertError};
use crate::error::{Error, Result, RoutingError};
use crate::field_path::FieldPath;
use crate::query::{discover, QueryAlias, QueryParameter, QueryParameterCustomization, QueryTable};
use crate::template::{PathTemplate, SegmentKind};
use crate::trie::FieldPathTrie;
use crate::types::{EndpointSpec, StreamConfig};
use axum::http::Method;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Call shape of an RPC method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl MethodKind {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => MethodKind::Unary,
            (false, true) => MethodKind::ServerStreaming,
            (true, false) => MethodKind::ClientStreaming,
            (true, true) => MethodKind::BidiStreaming,
        }
    }

    pub fn is_streaming(self) -> bool {
        self != MethodKind::Unary
    }

    pub fn streams_requests(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::BidiStreaming)
    }

    pub fn streams_responses(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::BidiStreaming)
    }
}

/// Compiled association between one HTTP verb + path template and an RPC
#[derive(Debug, Clone)]
pub struct Binding {
    method: MethodDescriptor,
    index: usize,
    http_method: Method,
    template: PathTemplate,
    path_parameters: Vec<FieldPath>,
    body: Option<FieldPath>,
    response_body: Option<FieldPath>,
    query_customization: QueryParameterCustomization,
    query_parameters: QueryTable,
    stream: Option<StreamConfig>,
    /// Paths filled from the body or the URL path, under both name forms
    request_claims: FieldPathTrie,
}

impl Binding {
    /// Build binding number `index` of `method` (0 is the primary one).
    pub fn build(method: &MethodDescriptor, spec: &EndpointSpec, index: usize) -> Result<Self> {
        let kind = MethodKind::of(method);
        let input = method.input();

        let (http_method, raw_path) = spec
            .pattern
            .as_ref()
            .ok_or(Error::MissingPattern)?
            .resolve()?;
        let template = PathTemplate::parse(raw_path)?;
        if kind.streams_requests() && template.has_variables() {
            return Err(Error::ClientStreamingPathParameters(template.to_string()));
        }

        let path_parameters = template
            .variables()
            .map(|segment| FieldPath::resolve_path_parameter(&input, &segment.value))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let body = match spec.body.as_str() {
            "" => None,
            "*" => Some(FieldPath::root()),
            selector => Some(FieldPath::resolve(&input, selector)?),
        };
        let response_body = match spec.response_body.as_str() {
            "" | "*" => None,
            selector => Some(FieldPath::resolve(&method.output(), selector)?),
        };

        let mut claims = FieldPathTrie::new();
        for path in body.iter().chain(&path_parameters) {
            claim(&mut claims, path);
        }
        let request_claims = claims.clone();

        let query_customization = customize_query(&input, spec, &mut claims)?;

        let mut parameters: Vec<QueryParameter> = query_customization
            .aliases
            .iter()
            .map(|alias| QueryParameter {
                name: alias.name.clone(),
                path: alias.path.clone(),
            })
            .collect();
        if !query_customization.disable_auto_discovery {
            parameters.extend(discover(&input, &claims));
        }

        let stream = if kind.is_streaming() {
            let config = StreamConfig::for_binding(spec.stream.as_ref(), &http_method);
            let available = match kind {
                MethodKind::ServerStreaming => !config.is_empty(),
                _ => config.allow_websocket || config.allow_chunked_transfer,
            };
            if !available {
                return Err(Error::NoStreamingMethod(format!("{http_method} {template}")));
            }
            Some(config)
        } else {
            None
        };

        Ok(Self {
            method: method.clone(),
            index,
            http_method,
            template,
            path_parameters,
            body,
            response_body,
            query_customization,
            query_parameters: QueryTable::new(parameters),
            stream,
            request_claims,
        })
    }

    /// Fully qualified RPC name
    pub fn selector(&self) -> &str {
        self.method.full_name()
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        MethodKind::of(&self.method)
    }

    /// 0 for the primary binding, 1.. for additional bindings
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn http_method(&self) -> &Method {
        &self.http_method
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn path_parameters(&self) -> &[FieldPath] {
        &self.path_parameters
    }

    pub fn body(&self) -> Option<&FieldPath> {
        self.body.as_ref()
    }

    pub fn response_body(&self) -> Option<&FieldPath> {
        self.response_body.as_ref()
    }

    pub fn query_customization(&self) -> &QueryParameterCustomization {
        &self.query_customization
    }

    pub fn query_parameters(&self) -> &QueryTable {
        &self.query_parameters
    }

    /// Transport flags; `None` for unary methods
    pub fn stream_config(&self) -> Option<&StreamConfig> {
        self.stream.as_ref()
    }

    pub fn request_claims(&self) -> &FieldPathTrie {
        &self.request_claims
    }

    /// Store captured path values in `message`. Repeated fields take a
    /// `separator`-delimited list.
    pub fn populate_path_parameters(
        &self,
        message: &mut DynamicMessage,
        captures: &[String],
        separator: char,
    ) -> Result<()> {
        for (idx, path) in self.path_parameters.iter().enumerate() {
            let name = path.selector();
            let raw = match captures.get(idx) {
                Some(raw) if !raw.is_empty() => raw.as_str(),
                _ => return Err(Error::PathParameterMissing(name)),
            };
            let repeated = path.leaf().is_some_and(|l| l.target.is_list());
            let values: Vec<&str> = if repeated {
                raw.split(separator).collect()
            } else {
                vec![raw]
            };

            populate_field(message, path, &values).map_err(|e| match e {
                ConvertError::UnknownEnum { value, .. } => {
                    Error::PathParameterInvalidEnum { name, value }
                }
                ConvertError::Mismatch(reason) => Error::PathParameterTypeMismatch { name, reason },
            })?;
        }
        Ok(())
    }
}

fn claim(trie: &mut FieldPathTrie, path: &FieldPath) {
    trie.insert(&path.selector());
    trie.insert(&path.json_selector());
}

/// Resolve ignored fields and aliases, claiming each in `claims`.
fn customize_query(
    input: &MessageDescriptor,
    spec: &EndpointSpec,
    claims: &mut FieldPathTrie,
) -> Result<QueryParameterCustomization> {
    let mut customization = QueryParameterCustomization {
        disable_auto_discovery: spec.disable_query_param_discovery,
        ..Default::default()
    };

    for param in spec.query_params.iter().filter(|p| p.ignore) {
        let path = FieldPath::resolve(input, &param.selector)?;
        claim(claims, &path);
        customization.ignored_fields.push(path);
    }

    for param in spec.query_params.iter().filter(|p| !p.ignore) {
        let path = FieldPath::resolve(input, &param.selector)?;
        let name = if param.name.is_empty() {
            param.selector.clone()
        } else {
            param.name.clone()
        };

        if claims.has_common_prefix(&path.selector())
            || claims.has_common_prefix(&path.json_selector())
        {
            return Err(Error::BindingConflict(format!(
                "query parameter {name:?} overlaps field {} which is already bound",
                path.selector()
            )));
        }
        if customization.aliases.iter().any(|a| a.name == name) {
            return Err(Error::BindingConflict(format!(
                "query parameter name {name:?} is used twice"
            )));
        }
        path.check_scalar_leaf(true)?;

        claim(claims, &path);
        customization.aliases.push(QueryAlias {
            is_custom_name: name != param.selector,
            name,
            path,
        });
    }

    Ok(customization)
}

/// Collects bindings for many endpoints, rejecting duplicate routes.
pub struct BindingBuilder {
    pool: DescriptorPool,
    bindings: Vec<Binding>,
    /// (service, verb, pattern) -> selector that registered it
    routes: HashMap<(String, Method, String), String>,
}

impl BindingBuilder {
    pub fn new(pool: DescriptorPool) -> Self {
        Self {
            pool,
            bindings: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Bind the primary pattern of `spec` and all its additional bindings.
    /// Errors name the offending selector.
    pub fn add_endpoint(&mut self, spec: &EndpointSpec) -> Result<()> {
        let selector = spec.selector.trim_start_matches('.');
        let method = find_method(&self.pool, selector)?;

        let nested = spec
            .additional_bindings
            .iter()
            .any(|b| !b.additional_bindings.is_empty());
        if nested {
            return Err(Error::for_selector(
                selector,
                Error::BindingConflict("additional bindings cannot be nested".into()),
            ));
        }

        let specs = std::iter::once(spec.clone()).chain(spec.additional_bindings.iter().map(|b| {
            EndpointSpec {
                selector: selector.to_string(),
                stream: b.stream.or(spec.stream),
                ..b.clone()
            }
        }));

        for (index, binding_spec) in specs.enumerate() {
            let binding = Binding::build(&method, &binding_spec, index)
                .map_err(|e| Error::for_selector(selector, e))?;
            self.register(binding)?;
        }
        Ok(())
    }

    pub fn add_endpoints<'a, I>(&mut self, specs: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a EndpointSpec>,
    {
        specs.into_iter().try_for_each(|spec| self.add_endpoint(spec))
    }

    fn register(&mut self, binding: Binding) -> Result<()> {
        let key = (
            binding.method.parent_service().full_name().to_string(),
            binding.http_method.clone(),
            binding.template.pattern(),
        );
        if let Some(existing) = self.routes.get(&key) {
            return Err(Error::for_selector(
                binding.selector(),
                Error::BindingConflict(format!(
                    "duplicate mapping {} {} (already bound to {existing})",
                    binding.http_method, binding.template
                )),
            ));
        }

        debug!(
            selector = binding.selector(),
            method = %binding.http_method,
            template = %binding.template,
            query_parameters = binding.query_parameters.len(),
            "registered binding"
        );
        self.routes.insert(key, binding.selector().to_string());
        self.bindings.push(binding);
        Ok(())
    }

    pub fn build(self) -> BindingTable {
        info!(bindings = self.bindings.len(), "binding table built");
        BindingTable {
            bindings: self.bindings.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Look up `package.Service.Method` in `pool`
pub fn find_method(pool: &DescriptorPool, selector: &str) -> Result<MethodDescriptor> {
    selector
        .rsplit_once('.')
        .and_then(|(service, method)| {
            pool.get_service_by_name(service)?
                .methods()
                .find(|m| m.name() == method)
        })
        .ok_or_else(|| Error::Descriptor(format!("method {selector} not found")))
}

/// A binding selected for a request, with its captured path values
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub binding: Arc<Binding>,
    pub captures: Vec<String>,
}

/// Immutable, shareable set of bindings
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: Vec<Arc<Binding>>,
}

impl BindingTable {
    pub fn bindings(&self) -> &[Arc<Binding>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Match a request against the table.
    ///
    /// Among bindings for `method` that fit the path, the one with the most
    /// literal segments wins, ties going to the first registered.
    pub fn find(&self, method: &Method, path: &str) -> std::result::Result<RouteMatch, RoutingError> {
        let parts: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned())
            .collect();

        let mut best: Option<(usize, RouteMatch)> = None;
        let mut other_verb = false;
        for binding in &self.bindings {
            let Some(captures) = binding.template.match_segments(&parts) else {
                continue;
            };
            if &binding.http_method != method {
                other_verb = true;
                continue;
            }

            let literals = binding
                .template
                .segments()
                .iter()
                .filter(|s| s.kind == SegmentKind::Literal)
                .count();
            if best.as_ref().map_or(true, |(score, _)| literals > *score) {
                best = Some((
                    literals,
                    RouteMatch {
                        binding: binding.clone(),
                        captures,
                    },
                ));
            }
        }

        match best {
            Some((_, found)) => Ok(found),
            None if other_verb => Err(RoutingError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            }),
            None => Err(RoutingError::NotFound {
                method: method.to_string(),
                path: path.to_string(),
            }),
        }
    }
}
