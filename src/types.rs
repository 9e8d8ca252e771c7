//! Endpoint specification records and streaming capability flags

use crate::error::{Error, Result};
use axum::http::Method;
use serde::Deserialize;

/// HTTP pattern of an endpoint, one variant per shorthand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Get(String),
    Put(String),
    Post(String),
    Delete(String),
    Patch(String),
    /// Any other verb, e.g. `HEAD` or `OPTIONS`
    Custom { method: String, path: String },
}

impl Pattern {
    /// Resolve to the HTTP verb and raw path template string
    pub fn resolve(&self) -> Result<(Method, &str)> {
        let resolved = match self {
            Pattern::Get(path) => (Method::GET, path.as_str()),
            Pattern::Put(path) => (Method::PUT, path.as_str()),
            Pattern::Post(path) => (Method::POST, path.as_str()),
            Pattern::Delete(path) => (Method::DELETE, path.as_str()),
            Pattern::Patch(path) => (Method::PATCH, path.as_str()),
            Pattern::Custom { method, path } => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| Error::Descriptor(format!("invalid HTTP method {method:?}: {e}")))?;
                (method, path.as_str())
            }
        };
        Ok(resolved)
    }
}

/// A query parameter customization as written in the endpoint record
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryParamSpec {
    /// Dotted field path in the request message
    pub selector: String,
    /// Query key to expose the field under; defaults to the selector
    pub name: String,
    /// Exclude the field (and everything below it) from the query string
    pub ignore: bool,
}

impl QueryParamSpec {
    pub fn alias(selector: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            name: name.into(),
            ignore: false,
        }
    }

    pub fn ignore(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            name: String::new(),
            ignore: true,
        }
    }
}

/// Streaming transports an endpoint opts out of
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamSpec {
    pub disable_websockets: bool,
    pub disable_sse: bool,
    pub disable_chunked_transfer: bool,
}

/// Streaming transports a binding accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub allow_websocket: bool,
    pub allow_sse: bool,
    pub allow_chunked_transfer: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            allow_websocket: true,
            allow_sse: true,
            allow_chunked_transfer: true,
        }
    }
}

impl StreamConfig {
    /// Narrow the defaults by `spec`. Websocket upgrades and event streams
    /// are only ever initiated with GET, so other verbs lose both.
    pub fn for_binding(spec: Option<&StreamSpec>, method: &Method) -> Self {
        let spec = spec.copied().unwrap_or_default();
        let get = method == Method::GET;
        Self {
            allow_websocket: get && !spec.disable_websockets,
            allow_sse: get && !spec.disable_sse,
            allow_chunked_transfer: !spec.disable_chunked_transfer,
        }
    }

    /// True when no transport is left
    pub fn is_empty(&self) -> bool {
        !(self.allow_websocket || self.allow_sse || self.allow_chunked_transfer)
    }
}

/// One HTTP mapping of an RPC method.
///
/// Deserializes from the usual `http` rule layout, e.g.
///
/// ```json
/// {"selector": "example.v1.EchoService.Echo", "post": "/v1/echo", "body": "*"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEndpointSpec")]
pub struct EndpointSpec {
    /// Fully qualified method name, `package.Service.Method`
    pub selector: String,
    pub pattern: Option<Pattern>,
    /// `""` for no body, `"*"` for the whole request message, else a field path
    pub body: String,
    /// `""` for the whole response message, else a field path
    pub response_body: String,
    pub query_params: Vec<QueryParamSpec>,
    pub disable_query_param_discovery: bool,
    pub additional_bindings: Vec<EndpointSpec>,
    pub stream: Option<StreamSpec>,
}

impl EndpointSpec {
    pub fn new(selector: impl Into<String>, pattern: Pattern) -> Self {
        Self {
            selector: selector.into(),
            pattern: Some(pattern),
            ..Default::default()
        }
    }

    pub fn get(selector: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(selector, Pattern::Get(path.into()))
    }

    pub fn post(selector: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(selector, Pattern::Post(path.into()))
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_response_body(mut self, response_body: impl Into<String>) -> Self {
        self.response_body = response_body.into();
        self
    }

    pub fn with_query_param(mut self, param: QueryParamSpec) -> Self {
        self.query_params.push(param);
        self
    }

    pub fn without_query_param_discovery(mut self) -> Self {
        self.disable_query_param_discovery = true;
        self
    }

    pub fn with_stream(mut self, stream: StreamSpec) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_additional_binding(mut self, binding: EndpointSpec) -> Self {
        self.additional_bindings.push(binding);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEndpointSpec {
    selector: String,
    get: Option<String>,
    put: Option<String>,
    post: Option<String>,
    delete: Option<String>,
    patch: Option<String>,
    custom: Option<RawCustomPattern>,
    body: String,
    response_body: String,
    query_params: Vec<QueryParamSpec>,
    disable_query_param_discovery: bool,
    additional_bindings: Vec<EndpointSpec>,
    stream: Option<StreamSpec>,
}

#[derive(Debug, Deserialize)]
struct RawCustomPattern {
    #[serde(alias = "method")]
    kind: String,
    path: String,
}

impl TryFrom<RawEndpointSpec> for EndpointSpec {
    type Error = String;

    fn try_from(raw: RawEndpointSpec) -> std::result::Result<Self, Self::Error> {
        let mut patterns = [
            raw.get.map(Pattern::Get),
            raw.put.map(Pattern::Put),
            raw.post.map(Pattern::Post),
            raw.delete.map(Pattern::Delete),
            raw.patch.map(Pattern::Patch),
            raw.custom.map(|c| Pattern::Custom {
                method: c.kind,
                path: c.path,
            }),
        ]
        .into_iter()
        .flatten();

        let pattern = patterns.next();
        if patterns.next().is_some() {
            return Err(format!(
                "endpoint {} sets more than one HTTP pattern",
                raw.selector
            ));
        }

        Ok(EndpointSpec {
            selector: raw.selector,
            pattern,
            body: raw.body,
            response_body: raw.response_body,
            query_params: raw.query_params,
            disable_query_param_discovery: raw.disable_query_param_discovery,
            additional_bindings: raw.additional_bindings,
            stream: raw.stream,
        })
    }
}
