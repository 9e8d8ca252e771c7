//! Downstream gRPC invocation.
//!
//! The router only ever talks to a [`Downstream`], which takes and returns
//! [`DynamicMessage`]s. [`GrpcClient`] is the tonic-backed implementation
//! used in production; tests substitute an in-process fake.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::uri::PathAndQuery;
use prost::bytes::Buf;
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status};

/// Stream of responses produced by a server or bidi streaming call
pub type MessageStream = BoxStream<'static, std::result::Result<DynamicMessage, Status>>;

/// Stream of requests fed into a client or bidi streaming call
pub type RequestStream = BoxStream<'static, DynamicMessage>;

/// A target able to execute RPCs described by a [`MethodDescriptor`].
///
/// Request metadata and deadlines travel on the [`tonic::Request`]; response
/// metadata is read back from the [`tonic::Response`].
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> std::result::Result<Response<DynamicMessage>, Status>;

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> std::result::Result<Response<MessageStream>, Status>;

    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> std::result::Result<Response<DynamicMessage>, Status>;

    async fn streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> std::result::Result<Response<MessageStream>, Status>;
}

/// Dynamic gRPC client for one upstream server
///
/// Every [`MethodDescriptor`] of every service the server hosts can be
/// invoked through the same channel.
///
/// # Example
///
/// ```rust,no_run
/// use grpc_rest_gateway::GrpcClient;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Connect immediately
/// let client = GrpcClient::new("http://localhost:50051").await?;
///
/// // Or lazy connect with a per-call deadline
/// let lazy_client = GrpcClient::builder("http://localhost:50051")
///     .timeout(Duration::from_secs(5))
///     .connect_lazy()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GrpcClient {
    endpoint: String,
    channel: Channel,
    insecure: bool,
}

impl GrpcClient {
    /// Start building a gRPC client with custom connection behavior.
    pub fn builder(endpoint: impl Into<String>) -> GrpcClientBuilder {
        GrpcClientBuilder::new(endpoint)
    }

    /// Connect to a plaintext endpoint
    pub async fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::builder(endpoint).connect().await
    }

    /// Connect over TLS
    pub async fn new_secure(endpoint: impl Into<String>) -> Result<Self> {
        Self::builder(endpoint).insecure(false).connect().await
    }

    /// Create a new client without awaiting the connection (lazy connect on first use)
    ///
    /// This is useful when the service might not be up yet when the gateway starts.
    pub fn connect_lazy(endpoint: impl Into<String>, insecure: bool) -> Result<Self> {
        Self::builder(endpoint).insecure(insecure).connect_lazy()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Wait for the channel and resolve everything a call to `method` needs
    async fn prepare(
        &self,
        method: &MethodDescriptor,
    ) -> std::result::Result<(Grpc<Channel>, PathAndQuery, DynamicCodec), Status> {
        let path = method_path(method)?;
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("{} not ready: {e}", self.endpoint)))?;
        Ok((grpc, path, DynamicCodec::new(method.output())))
    }
}

impl std::fmt::Debug for GrpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcClient")
            .field("endpoint", &self.endpoint)
            .field("insecure", &self.insecure)
            .finish()
    }
}

#[async_trait]
impl Downstream for GrpcClient {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> std::result::Result<Response<DynamicMessage>, Status> {
        let (mut grpc, path, codec) = self.prepare(method).await?;
        grpc.unary(request, path, codec).await
    }

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> std::result::Result<Response<MessageStream>, Status> {
        let (mut grpc, path, codec) = self.prepare(method).await?;
        let response = grpc.server_streaming(request, path, codec).await?;
        Ok(box_streaming(response))
    }

    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> std::result::Result<Response<DynamicMessage>, Status> {
        let (mut grpc, path, codec) = self.prepare(method).await?;
        grpc.client_streaming(request, path, codec).await
    }

    async fn streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> std::result::Result<Response<MessageStream>, Status> {
        let (mut grpc, path, codec) = self.prepare(method).await?;
        let response = grpc.streaming(request, path, codec).await?;
        Ok(box_streaming(response))
    }
}

fn method_path(method: &MethodDescriptor) -> std::result::Result<PathAndQuery, Status> {
    format!("/{}/{}", method.parent_service().full_name(), method.name())
        .parse()
        .map_err(|e| Status::internal(format!("invalid gRPC path: {e}")))
}

fn box_streaming(response: Response<tonic::Streaming<DynamicMessage>>) -> Response<MessageStream> {
    let (metadata, stream, extensions) = response.into_parts();
    Response::from_parts(metadata, stream.boxed(), extensions)
}

/// Builder for configuring gRPC client creation.
pub struct GrpcClientBuilder {
    endpoint: String,
    insecure: bool,
    lazy: bool,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
}

impl GrpcClientBuilder {
    fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            insecure: true,
            lazy: false,
            connect_timeout: None,
            timeout: None,
        }
    }

    /// Toggle insecure (plaintext) connections.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Perform a lazy connect (defer until first use).
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Bound the time spent establishing the connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Deadline applied to calls that carry no `grpc-timeout` of their own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Establish the channel immediately.
    pub async fn connect(self) -> Result<GrpcClient> {
        if self.lazy {
            return self.connect_lazy();
        }

        let channel = self
            .configure()?
            .connect()
            .await
            .map_err(|e| Error::Connection(format!("{}: {e}", self.endpoint)))?;
        Ok(self.finish(channel))
    }

    /// Create a lazily connecting client.
    pub fn connect_lazy(self) -> Result<GrpcClient> {
        let channel = self.configure()?.connect_lazy();
        Ok(self.finish(channel))
    }

    fn configure(&self) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| Error::Connection(format!("{}: {e}", self.endpoint)))?;

        if !self.insecure {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new())
                .map_err(|e| Error::Connection(e.to_string()))?;
        }
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        Ok(endpoint)
    }

    fn finish(self, channel: Channel) -> GrpcClient {
        GrpcClient {
            endpoint: self.endpoint,
            channel,
            insecure: self.insecure,
        }
    }
}

/// Encodes requests and decodes responses as [`DynamicMessage`]s of a
/// descriptor known only at runtime; `ProstCodec` needs `Default` types.
#[derive(Clone)]
struct DynamicCodec {
    response: MessageDescriptor,
}

impl DynamicCodec {
    fn new(response: MessageDescriptor) -> Self {
        Self { response }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = Self;
    type Decoder = Self;

    fn encoder(&mut self) -> Self::Encoder {
        self.clone()
    }

    fn decoder(&mut self) -> Self::Decoder {
        self.clone()
    }
}

impl Decoder for DynamicCodec {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        buf: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        // tonic hands over exactly one frame; a zero-length frame is the
        // default message, not a request for more data
        let bytes = buf.copy_to_bytes(buf.remaining());
        DynamicMessage::decode(self.response.clone(), bytes)
            .map(Some)
            .map_err(|e| Status::internal(format!("decode error: {e}")))
    }
}

impl Encoder for DynamicCodec {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        buf: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        item.encode(buf)
            .map_err(|e| Status::internal(format!("encode error: {e}")))
    }
}
