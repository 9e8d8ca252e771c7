//! Middleware support for the gateway

use crate::error::{Error, Result};
use axum::http::{HeaderMap, Method};
use std::sync::Arc;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};

/// Context passed to middleware
///
/// Built after the route has been matched and before the downstream call,
/// so middleware sees the RPC being invoked and may add outgoing metadata.
#[derive(Debug)]
pub struct Context {
    /// Incoming HTTP request headers
    pub headers: HeaderMap,

    /// Metadata that will be sent with the downstream call
    pub metadata: MetadataMap,

    /// Fully qualified RPC name, `package.Service.Method`
    pub selector: String,

    pub method: Method,
    pub path: String,
}

impl Context {
    pub fn new(
        headers: HeaderMap,
        metadata: MetadataMap,
        selector: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        Self {
            headers,
            metadata,
            selector: selector.into(),
            method,
            path: path.into(),
        }
    }

    /// Add an ASCII metadata entry to the downstream call
    pub fn insert_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        let key: MetadataKey<Ascii> = key
            .parse()
            .map_err(|_| Error::Middleware(format!("invalid metadata key {key:?}")))?;
        let value: MetadataValue<Ascii> = value
            .parse()
            .map_err(|_| Error::Middleware(format!("invalid metadata value for {key}")))?;
        self.metadata.insert(key, value);
        Ok(())
    }
}

/// Middleware trait for processing requests
///
/// Middleware runs once per request, in registration order, before the
/// downstream RPC is invoked. Returning an error aborts the request and the
/// error is written back through the negotiated marshaler.
///
/// # Example
///
/// ```rust
/// use grpc_rest_gateway::middleware::{Middleware, Context};
/// use grpc_rest_gateway::Result;
///
/// struct TenantMiddleware;
///
/// #[async_trait::async_trait]
/// impl Middleware for TenantMiddleware {
///     async fn call(&self, ctx: &mut Context) -> Result<()> {
///         ctx.insert_metadata("x-tenant", "acme")
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request context
    async fn call(&self, ctx: &mut Context) -> Result<()>;
}

/// Authentication middleware
///
/// Validates the `Authorization` header using a provided validation function.
/// If validation fails, it returns an `Unauthorized` error.
#[derive(Clone)]
pub struct AuthMiddleware {
    pub validate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl AuthMiddleware {
    pub fn new<F>(validate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            validate: Arc::new(validate),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        if let Some(auth_header) = ctx.headers.get("authorization") {
            if let Ok(token) = auth_header.to_str() {
                if (self.validate)(token) {
                    return Ok(());
                }
            }
        }
        Err(Error::Unauthorized(
            "Invalid or missing authorization".to_string(),
        ))
    }
}

/// Logging middleware
///
/// Logs every routed request using the `tracing` crate.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        tracing::debug!(
            method = %ctx.method,
            path = %ctx.path,
            selector = %ctx.selector,
            metadata = ctx.metadata.len(),
            "dispatching request"
        );
        Ok(())
    }
}
