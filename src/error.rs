//! Error types for the gRPC-REST gateway

use crate::field_path::FieldPathError;
use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use tonic::Code;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// This enum covers both build-time failures (template parsing, field path
/// resolution, binding conflicts) and request-time failures (routing,
/// marshaling, parameter extraction, downstream errors).
#[derive(Error, Debug)]
pub enum Error {
    /// gRPC status returned by the downstream service
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Descriptor set could not be loaded or a selector does not exist in it
    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Path template failed to parse
    #[error("invalid path template {path:?}: unexpected segment {segment:?}")]
    Template { path: String, segment: String },

    /// Field path failed to resolve against the message schema
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),

    /// Binding construction failed for a specific RPC selector
    #[error("invalid binding for {selector}: {source}")]
    InvalidBinding {
        selector: String,
        #[source]
        source: Box<Error>,
    },

    /// Endpoint specification without any HTTP pattern
    #[error("no HTTP pattern given")]
    MissingPattern,

    /// Duplicate route or overlapping query alias
    #[error("binding conflict: {0}")]
    BindingConflict(String),

    /// Client-streaming method bound to a template with variables
    #[error("path parameters in client streaming not allowed: {0}")]
    ClientStreamingPathParameters(String),

    /// Streaming method whose binding disables every delivery mode
    #[error("no streaming method available for {0}")]
    NoStreamingMethod(String),

    /// No binding matched the request
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Request or response payload could not be (un)marshaled
    #[error("failed to {direction} message: {message}")]
    Marshal { direction: Direction, message: String },

    /// Path variable matched an empty value
    #[error("missing path parameter: {0}")]
    PathParameterMissing(String),

    /// Path variable could not be converted to the target field type
    #[error("type mismatch, parameter: {name}, error: {reason}")]
    PathParameterTypeMismatch { name: String, reason: String },

    /// Path variable names an enum value that does not exist
    #[error("could not parse path as enum value, parameter: {name}, value: {value}")]
    PathParameterInvalidEnum { name: String, value: String },

    /// Query string could not be applied to the request message
    #[error("invalid query parameters: {0}")]
    InvalidQueryParameters(String),

    /// Request asked for a streaming transport the binding does not allow
    #[error("streaming method not allowed: {0}")]
    StreamingMethodNotAllowed(String),

    /// Authentication/authorization errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Middleware errors
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// A request body or streamed frame over the configured limit
    #[error("request payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Routing failures raised when matching a request against the binding table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Not Found: no binding for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("Method Not Allowed: {method} for path {path}")]
    MethodNotAllowed { method: String, path: String },
}

/// Direction of a marshaling failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Decoding the client's request payload
    Inbound,
    /// Encoding the downstream response
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("unmarshal inbound"),
            Direction::Outbound => f.write_str("marshal outbound"),
        }
    }
}

impl Error {
    /// Wrap a build-time error with the selector of the RPC being bound.
    pub fn for_selector(selector: impl Into<String>, source: Error) -> Self {
        Error::InvalidBinding {
            selector: selector.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn inbound(message: impl fmt::Display) -> Self {
        Error::Marshal {
            direction: Direction::Inbound,
            message: message.to_string(),
        }
    }

    pub(crate) fn outbound(message: impl fmt::Display) -> Self {
        Error::Marshal {
            direction: Direction::Outbound,
            message: message.to_string(),
        }
    }

    /// Canonical gRPC code for this error
    pub fn grpc_code(&self) -> Code {
        match self {
            Error::Grpc(status) => status.code(),
            Error::Routing(RoutingError::NotFound { .. }) => Code::NotFound,
            Error::Routing(RoutingError::MethodNotAllowed { .. }) => Code::Unimplemented,
            Error::Marshal {
                direction: Direction::Inbound,
                ..
            }
            | Error::PathParameterMissing(_)
            | Error::PathParameterTypeMismatch { .. }
            | Error::PathParameterInvalidEnum { .. }
            | Error::InvalidQueryParameters(_) => Code::InvalidArgument,
            Error::StreamingMethodNotAllowed(_) => Code::Unimplemented,
            Error::Unauthorized(_) => Code::Unauthenticated,
            Error::Connection(_) | Error::Transport(_) => Code::Unavailable,
            Error::PayloadTooLarge(_) => Code::ResourceExhausted,
            _ => Code::Internal,
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Routing(RoutingError::MethodNotAllowed { .. })
            | Error::StreamingMethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            other => http_status_from_code(other.grpc_code()),
        }
    }

    /// Convert error to the structured body written back to the client
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            Error::Grpc(status) => ErrorBody::from_status(status),
            other => ErrorBody {
                code: other.grpc_code() as i32,
                message: other.to_string(),
                details: Vec::new(),
            },
        }
    }
}

/// Map a gRPC status code onto the HTTP status the gateway responds with.
pub fn http_status_from_code(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Structured error body, wire-compatible with `google.rpc.Status`.
///
/// The same value is written through whichever marshaler the request
/// negotiated, so it is both a protobuf message and serde-serializable.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorBody {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

impl ErrorBody {
    /// Build the body for a downstream status, decoding any rich details it carries.
    pub fn from_status(status: &tonic::Status) -> Self {
        let details = if status.details().is_empty() {
            Vec::new()
        } else {
            ErrorBody::decode(status.details())
                .map(|rich| rich.details)
                .unwrap_or_default()
        };

        ErrorBody {
            code: status.code() as i32,
            message: status.message().to_string(),
            details,
        }
    }
}

impl Serialize for ErrorBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.details.is_empty() { 2 } else { 3 };
        let mut state = serializer.serialize_struct("ErrorBody", len)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if !self.details.is_empty() {
            let details: Vec<AnyJson<'_>> = self.details.iter().map(AnyJson).collect();
            state.serialize_field("details", &details)?;
        }
        state.end()
    }
}

/// JSON rendering of `google.protobuf.Any` without a type registry.
struct AnyJson<'a>(&'a prost_types::Any);

impl Serialize for AnyJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Any", 2)?;
        state.serialize_field("@type", &self.0.type_url)?;
        state.serialize_field("value", &BASE64.encode(&self.0.value))?;
        state.end()
    }
}
