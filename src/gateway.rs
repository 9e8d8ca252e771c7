//! Gateway builder and main orchestration

use crate::binding::BindingBuilder;
use crate::error::{Error, Result};
use crate::grpc_client::{Downstream, GrpcClient};
use crate::marshal::Marshaler;
use crate::middleware::Middleware;
use crate::runtime::{ErrorHandler, ServeMux, DEFAULT_BODY_LIMIT};
use crate::types::EndpointSpec;
use axum::response::Response;
use axum::Router;
use prost_reflect::DescriptorPool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Main Gateway struct - entry point for the library
pub struct Gateway {
    mux: ServeMux,
    cors: Option<CorsLayer>,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Get the ServeMux
    pub fn mux(&self) -> &ServeMux {
        &self.mux
    }

    /// Convert gateway into Axum router
    pub fn into_router(self) -> Router {
        let router = self.mux.into_router();
        match self.cors {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }
}

/// Builder for creating a Gateway
///
/// The binding table is constructed once, in [`GatewayBuilder::build`], and
/// is read-only while serving.
pub struct GatewayBuilder {
    descriptor_bytes: Option<Vec<u8>>,
    endpoints: Vec<EndpointSpec>,
    downstreams: HashMap<String, Arc<dyn Downstream>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    marshalers: Vec<(String, Arc<dyn Marshaler>)>,
    error_handler: Option<ErrorHandler>,
    path_separator: char,
    body_limit: usize,
    cors: Option<CorsLayer>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self {
            descriptor_bytes: None,
            endpoints: Vec::new(),
            downstreams: HashMap::new(),
            middlewares: Vec::new(),
            marshalers: Vec::new(),
            error_handler: None,
            path_separator: ',',
            body_limit: DEFAULT_BODY_LIMIT,
            cors: None,
        }
    }

    /// Provide a protobuf descriptor set (bytes)
    pub fn with_descriptor_set_bytes(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.descriptor_bytes = Some(bytes.as_ref().to_vec());
        self
    }

    /// Provide a protobuf descriptor set file
    pub fn with_descriptor_set_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path).map_err(Error::Io)?;
        self.descriptor_bytes = Some(data);
        Ok(self)
    }

    /// Bind one RPC (and its additional bindings)
    pub fn add_endpoint(mut self, endpoint: EndpointSpec) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn add_endpoints<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = EndpointSpec>,
    {
        self.endpoints.extend(endpoints);
        self
    }

    /// Serve every bound method of `service` through a tonic client
    pub fn add_grpc_client(self, service: impl Into<String>, client: GrpcClient) -> Self {
        self.add_downstream(service, Arc::new(client))
    }

    /// Serve every bound method of `service` through any [`Downstream`]
    pub fn add_downstream(
        mut self,
        service: impl Into<String>,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        let service = service.into();
        self.downstreams
            .insert(service.trim_start_matches('.').to_string(), downstream);
        self
    }

    /// Add middleware
    pub fn add_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Register a marshaler for a MIME type; `"*"` replaces the fallback
    pub fn with_marshaler(mut self, mime: impl Into<String>, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshalers.push((mime.into(), marshaler));
        self
    }

    /// Provide a handler that renders request errors.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error, &dyn Marshaler) -> Response + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Separator between the elements of a repeated path variable (default `,`)
    pub fn with_path_separator(mut self, separator: char) -> Self {
        self.path_separator = separator;
        self
    }

    /// Largest accepted request body, streamed frame or websocket message
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Apply a CORS policy to the router
    pub fn with_cors(mut self, cors: CorsLayer) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        let bytes = self
            .descriptor_bytes
            .ok_or_else(|| Error::Descriptor("descriptor set is required".into()))?;
        // the global pool already carries the google.protobuf well-known types
        let mut pool = DescriptorPool::global();
        pool.decode_file_descriptor_set(bytes.as_slice())
            .map_err(|e| Error::Descriptor(format!("failed to decode descriptor set: {e}")))?;

        let mut bindings = BindingBuilder::new(pool);
        bindings.add_endpoints(&self.endpoints)?;
        let bindings = bindings.build();

        for binding in bindings.bindings() {
            let service = binding.method().parent_service();
            if !self.downstreams.contains_key(service.full_name()) {
                tracing::warn!(
                    service = service.full_name(),
                    selector = binding.selector(),
                    "no downstream registered; calls will fail"
                );
            }
        }

        let mut mux = ServeMux::new(bindings)
            .with_path_separator(self.path_separator)
            .with_body_limit(self.body_limit);
        for (service, downstream) in self.downstreams {
            mux.add_downstream(service, downstream);
        }
        for (mime, marshaler) in self.marshalers {
            mux.set_marshaler(mime, marshaler);
        }

        // Add middlewares
        for middleware in self.middlewares {
            mux.add_middleware(middleware);
        }

        if let Some(handler) = self.error_handler {
            mux.set_error_handler_arc(handler);
        }

        Ok(Gateway {
            mux,
            cors: self.cors,
        })
    }

    /// Build and start the gateway server
    pub async fn serve(self, addr: impl Into<String>) -> Result<()> {
        let gateway = self.build()?;
        let addr = addr.into();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Gateway server listening on {}", addr);

        let app = gateway.into_router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
