//! # grpc-rest-gateway
//!
//! A Rust gateway that exposes gRPC services as RESTful HTTP/JSON APIs, driven
//! by declarative endpoint bindings over protobuf descriptors.
//!
//! ## Features
//!
//! - **Path templates**: literal segments, `{field.path}` variables, `*`
//!   single-segment wildcards and a trailing `{field.path=*}` catch-all, as in
//!   `/v1/shelves/{shelf}/books/{book.id}` or `/v1/files/{path=*}`
//! - **Request mapping**: body, path variables and automatically discovered
//!   query parameters populate one request message
//! - **Content negotiation**: JSON and protobuf-binary marshalers keyed by MIME type
//! - **Streaming**: server, client and bidirectional RPCs over chunked transfer,
//!   server-sent events or websockets
//! - **Middleware**: Extensible middleware system for auth and logging
//!
//! ## Main Components
//!
//! - [`Gateway`]: The main entry point for creating and running the gateway.
//! - [`GatewayBuilder`]: Configuration builder for the gateway.
//! - [`BindingBuilder`]: Low-level builder for the immutable binding table.
//! - [`ServeMux`]: Matches requests and dispatches them to a [`Downstream`].
//! - [`GrpcClient`]: Manages connections to gRPC services.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_rest_gateway::{EndpointSpec, Gateway, GrpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let descriptors = std::fs::read("greeter_descriptor.bin")?;
//!     let grpc_client = GrpcClient::new("http://localhost:50051").await?;
//!
//!     let gateway = Gateway::builder()
//!         .with_descriptor_set_bytes(descriptors)
//!         .add_endpoint(EndpointSpec::get("greeter.Greeter.SayHello", "/v1/hello/{name}"))
//!         .add_grpc_client("greeter.Greeter", grpc_client)
//!         .build()?;
//!
//!     let app = gateway.into_router();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod convert;
pub mod error;
pub mod field_path;
pub mod gateway;
pub mod grpc_client;
pub mod marshal;
pub mod middleware;
pub mod query;
pub mod runtime;
pub mod stream;
pub mod template;
pub mod trie;
pub mod types;

#[cfg(test)]
mod test_support;

pub use binding::{Binding, BindingBuilder, BindingTable, MethodKind, RouteMatch};
pub use error::{Error, ErrorBody, Result, RoutingError};
pub use field_path::{FieldPath, FieldPathError};
pub use gateway::{Gateway, GatewayBuilder};
pub use grpc_client::{Downstream, GrpcClient};
pub use marshal::{JsonMarshaler, Marshaler, MarshalerRegistry, ProtoMarshaler};
pub use middleware::{Context, Middleware};
pub use runtime::ServeMux;
pub use template::PathTemplate;
pub use types::{EndpointSpec, Pattern, QueryParamSpec, StreamConfig, StreamSpec};
