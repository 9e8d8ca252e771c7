//! Runtime support for the REST gateway - request dispatch onto gRPC methods.
//!
//! [`ServeMux`] owns the immutable binding table and drives every request
//! through the same stages: match the route, extract the request message
//! (body, then path variables, then query string), run middleware, invoke
//! the downstream RPC and marshal the result back to the client.

use crate::binding::{Binding, BindingTable, MethodKind, RouteMatch};
use crate::convert::message_at_mut;
use crate::error::{Error, ErrorBody, Result};
use crate::grpc_client::{Downstream, MessageStream, RequestStream};
use crate::marshal::{Marshaler, MarshalerRegistry};
use crate::middleware::{Context, Middleware};
use crate::stream::{
    self, body_frames, ChunkedConnection, DeliveryMode, FrameStream, SseConnection,
    StreamConnection, WebSocketConnection,
};
use axum::body::{Body, Bytes};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use futures::stream::StreamExt;
use prost_reflect::DynamicMessage;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::metadata::{Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Maps a header name (or metadata key) onto its counterpart; `None` drops it
pub type HeaderMatcher = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Renders a request-time error through the negotiated marshaler
pub type ErrorHandler = Arc<dyn Fn(&Error, &dyn Marshaler) -> Response + Send + Sync>;

const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";
const PERMANENT_HEADER_PREFIX: &str = "grpcgateway-";
const GRPC_TIMEOUT: &str = "grpc-timeout";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Largest request body, streamed frame or websocket message accepted
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Standard HTTP request headers forwarded as `grpcgateway-<name>`
const PERMANENT_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-language",
    "accept-ranges",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "date",
    "expect",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-schedule-tag-match",
    "if-unmodified-since",
    "max-forwards",
    "origin",
    "pragma",
    "referer",
    "user-agent",
    "via",
    "warning",
];

/// `Grpc-Metadata-<key>` becomes `<key>`; permanent headers get the
/// `grpcgateway-` prefix; everything else stays at the HTTP layer.
pub fn default_incoming_header_matcher(name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    if let Some(key) = name.strip_prefix(METADATA_HEADER_PREFIX) {
        return Some(key.to_string());
    }
    if PERMANENT_HEADERS.contains(&name.as_str()) {
        return Some(format!("{PERMANENT_HEADER_PREFIX}{name}"));
    }
    None
}

/// Every response metadata key is returned as `Grpc-Metadata-<key>`
pub fn default_outgoing_header_matcher(key: &str) -> Option<String> {
    Some(format!("Grpc-Metadata-{key}"))
}

/// Status from the error, body from [`Error::to_error_body`] in the
/// negotiated encoding.
pub fn default_error_handler(err: &Error, marshaler: &dyn Marshaler) -> Response {
    let status = err.status_code();
    match marshaler.marshal_error(&err.to_error_body()) {
        Ok(body) => {
            let mut response = (status, body).into_response();
            set_content_type(&mut response, marshaler.content_type());
            response
        }
        Err(e) => {
            error!(error = %e, "failed to marshal error body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to marshal error message",
            )
                .into_response()
        }
    }
}

/// ServeMux - main gateway handler
///
/// The `ServeMux` matches HTTP requests against the binding table, executes
/// middlewares and invokes the downstream RPC registered for the matched
/// method's service. It can be converted into an Axum router.
#[derive(Clone)]
pub struct ServeMux {
    bindings: BindingTable,
    downstreams: HashMap<String, Arc<dyn Downstream>>,
    marshalers: MarshalerRegistry,
    middlewares: Vec<Arc<dyn Middleware>>,
    error_handler: ErrorHandler,
    path_separator: char,
    body_limit: usize,
    incoming_header_matcher: HeaderMatcher,
    outgoing_header_matcher: HeaderMatcher,
}

impl ServeMux {
    /// Create a new ServeMux over an already built binding table
    pub fn new(bindings: BindingTable) -> Self {
        Self {
            bindings,
            downstreams: HashMap::new(),
            marshalers: MarshalerRegistry::default(),
            middlewares: Vec::new(),
            error_handler: Arc::new(default_error_handler),
            path_separator: ',',
            body_limit: DEFAULT_BODY_LIMIT,
            incoming_header_matcher: Arc::new(default_incoming_header_matcher),
            outgoing_header_matcher: Arc::new(default_outgoing_header_matcher),
        }
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Route calls for `service` (fully qualified) to `downstream`
    pub fn add_downstream(&mut self, service: impl Into<String>, downstream: Arc<dyn Downstream>) {
        self.downstreams.insert(service.into(), downstream);
    }

    pub fn with_downstream(
        mut self,
        service: impl Into<String>,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        self.add_downstream(service, downstream);
        self
    }

    /// Add middleware to the execution pipeline
    ///
    /// Middlewares are executed in the order they are added.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Use middleware (builder pattern)
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add_middleware(middleware);
        self
    }

    /// Register a marshaler for `mime`; `"*"` replaces the fallback
    pub fn set_marshaler(&mut self, mime: impl AsRef<str>, marshaler: Arc<dyn Marshaler>) {
        self.marshalers.insert(mime, marshaler);
    }

    pub fn with_marshaler(mut self, mime: impl AsRef<str>, marshaler: Arc<dyn Marshaler>) -> Self {
        self.set_marshaler(mime, marshaler);
        self
    }

    /// Set error handler from an `Arc` for cases where the caller already shares ownership.
    pub fn set_error_handler_arc(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Set error handler
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Error, &dyn Marshaler) -> Response + Send + Sync + 'static,
    {
        self.set_error_handler_arc(Arc::new(handler));
    }

    /// Separator between the elements of a repeated path variable
    pub fn with_path_separator(mut self, separator: char) -> Self {
        self.path_separator = separator;
        self
    }

    /// Cap on a unary request body and on each streamed request frame.
    /// Larger payloads are rejected with `413 Payload Too Large`.
    pub fn set_body_limit(&mut self, limit: usize) {
        self.body_limit = limit;
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.set_body_limit(limit);
        self
    }

    pub fn set_incoming_header_matcher<F>(&mut self, matcher: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.incoming_header_matcher = Arc::new(matcher);
    }

    pub fn set_outgoing_header_matcher<F>(&mut self, matcher: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.outgoing_header_matcher = Arc::new(matcher);
    }

    /// Handle one HTTP request
    ///
    /// Never fails: every error is rendered by the error handler with the
    /// marshaler negotiated from the request headers.
    pub async fn dispatch(&self, request: Request) -> Response {
        let (inbound, outbound) = self.marshalers.negotiate(request.headers());
        match self.route(request, inbound, outbound.clone()).await {
            Ok(response) => response,
            Err(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    warn!(error = %err, status = %status, "request failed");
                } else {
                    debug!(error = %err, status = %status, "request rejected");
                }
                (self.error_handler)(&err, outbound.as_ref())
            }
        }
    }

    async fn route(
        &self,
        request: Request,
        inbound: Arc<dyn Marshaler>,
        outbound: Arc<dyn Marshaler>,
    ) -> Result<Response> {
        let (mut parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let RouteMatch { binding, captures } = self.bindings.find(&parts.method, &path)?;
        debug!(
            method = %parts.method,
            path = %path,
            selector = binding.selector(),
            "matched binding"
        );

        let service = binding.method().parent_service().full_name().to_string();
        let downstream = self
            .downstreams
            .get(&service)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("no downstream registered for {service}")))?;
        let timeout = grpc_timeout(&parts.headers)?;

        let mut ctx = Context::new(
            parts.headers.clone(),
            self.request_metadata(&parts),
            binding.selector(),
            parts.method.clone(),
            path,
        );
        for middleware in &self.middlewares {
            middleware.call(&mut ctx).await?;
        }

        let call = Call {
            requests: Arc::new(RequestBuilder {
                binding: binding.clone(),
                captures,
                query: parts.uri.query().unwrap_or_default().to_string(),
                marshaler: inbound.clone(),
                separator: self.path_separator,
            }),
            binding,
            downstream,
            metadata: ctx.metadata,
            timeout,
            outbound,
            header_matcher: self.outgoing_header_matcher.clone(),
        };

        let kind = call.binding.kind();
        if !kind.is_streaming() {
            let payload = read_body(body, &call.binding, self.body_limit).await?;
            let response = call.unary(&payload).await?;
            return call.unary_response(response);
        }

        let config = call.binding.stream_config().copied().unwrap_or_default();
        let mode = stream::negotiate(&parts.headers, &config)?;
        if mode == DeliveryMode::WebSocket {
            let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
                .await
                .map_err(|rejection| Error::StreamingMethodNotAllowed(rejection.body_text()))?
                .max_message_size(self.body_limit);
            return Ok(upgrade.on_upgrade(move |socket| call.serve_websocket(socket)));
        }

        match kind {
            MethodKind::ClientStreaming => {
                let frames = body_frames(body, inbound.framing(), self.body_limit);
                let response = call.client_streaming(frames).await?;
                call.unary_response(response)
            }
            MethodKind::BidiStreaming => {
                let frames = body_frames(body, inbound.framing(), self.body_limit);
                let (mut conn, response) = open_connection(mode, frames, call.outbound.clone());
                let (upstream, errors) = call.bidi(conn.take_incoming()).await?;
                Ok(call.start_stream(conn, response, upstream, Some(errors)))
            }
            _ => {
                let payload = read_body(body, &call.binding, self.body_limit).await?;
                let upstream = call.server_streaming(&payload).await?;
                let (conn, response) =
                    open_connection(mode, futures::stream::empty().boxed(), call.outbound.clone());
                Ok(call.start_stream(conn, response, upstream, None))
            }
        }
    }

    /// Downstream metadata derived from the incoming request headers
    fn request_metadata(&self, parts: &Parts) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (name, value) in &parts.headers {
            if name == header::AUTHORIZATION {
                insert_metadata(&mut metadata, "authorization", value);
            }
            if let Some(key) = (self.incoming_header_matcher)(name.as_str()) {
                insert_metadata(&mut metadata, &key, value);
            }
        }

        let host = parts
            .headers
            .get(X_FORWARDED_HOST)
            .or_else(|| parts.headers.get(header::HOST))
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        if let Some(host) = host {
            insert_metadata(&mut metadata, X_FORWARDED_HOST, &host);
        }

        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            let ip = addr.ip().to_string();
            let chain = match parts
                .headers
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(previous) => format!("{previous}, {ip}"),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                insert_metadata(&mut metadata, X_FORWARDED_FOR, &value);
            }
        }

        metadata
    }

    /// Convert to Axum router
    ///
    /// Every path is handed to the mux; unmatched ones are answered with a
    /// structured `NotFound` error.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }
}

async fn handle_request(State(mux): State<Arc<ServeMux>>, request: Request) -> Response {
    mux.dispatch(request).await
}

/// Turns one request payload into a populated request message
struct RequestBuilder {
    binding: Arc<Binding>,
    captures: Vec<String>,
    query: String,
    marshaler: Arc<dyn Marshaler>,
    separator: char,
}

impl RequestBuilder {
    fn build(&self, payload: &[u8]) -> Result<DynamicMessage> {
        let input = self.binding.method().input();
        let mut message = match self.binding.body().map(|path| (path, path.leaf())) {
            None => DynamicMessage::new(input),
            Some((_, None)) => self.marshaler.unmarshal(payload, input)?,
            Some((path, Some(leaf))) => {
                let mut message = DynamicMessage::new(input);
                let parent = message_at_mut(&mut message, path.parents()).map_err(Error::inbound)?;
                self.marshaler
                    .unmarshal_field(payload, parent, &leaf.target)?;
                message
            }
        };

        self.binding
            .populate_path_parameters(&mut message, &self.captures, self.separator)?;
        self.binding.query_parameters().populate(
            &mut message,
            &self.query,
            self.binding.request_claims(),
        )?;
        Ok(message)
    }

    /// Build one request per frame. The first bad frame ends the stream and
    /// is reported through the returned receiver.
    fn stream(self: Arc<Self>, frames: FrameStream) -> (RequestStream, oneshot::Receiver<Error>) {
        let (tx, rx) = oneshot::channel();
        let requests = futures::stream::unfold((frames, Some(tx)), move |(mut frames, mut failed)| {
            let builder = self.clone();
            async move {
                let message = frames.next().await?.and_then(|frame| builder.build(&frame));
                match message {
                    Ok(message) => Some((message, (frames, failed))),
                    Err(e) => {
                        debug!(error = %e, "rejecting request frame");
                        if let Some(tx) = failed.take() {
                            let _ = tx.send(e);
                        }
                        None
                    }
                }
            }
        })
        .boxed();
        (requests, rx)
    }
}

/// A matched request ready to be sent downstream
struct Call {
    binding: Arc<Binding>,
    requests: Arc<RequestBuilder>,
    downstream: Arc<dyn Downstream>,
    metadata: MetadataMap,
    timeout: Option<Duration>,
    outbound: Arc<dyn Marshaler>,
    header_matcher: HeaderMatcher,
}

impl Call {
    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }

    async fn unary(&self, payload: &[u8]) -> Result<tonic::Response<DynamicMessage>> {
        let message = self.requests.build(payload)?;
        let request = self.request(message);
        Ok(self.downstream.unary(self.binding.method(), request).await?)
    }

    async fn server_streaming(&self, payload: &[u8]) -> Result<tonic::Response<MessageStream>> {
        let message = self.requests.build(payload)?;
        let request = self.request(message);
        Ok(self
            .downstream
            .server_streaming(self.binding.method(), request)
            .await?)
    }

    async fn client_streaming(&self, frames: FrameStream) -> Result<tonic::Response<DynamicMessage>> {
        let (requests, mut errors) = self.requests.clone().stream(frames);
        let response = self
            .downstream
            .client_streaming(self.binding.method(), self.request(requests))
            .await;
        if let Ok(err) = errors.try_recv() {
            return Err(err);
        }
        Ok(response?)
    }

    async fn bidi(
        &self,
        frames: FrameStream,
    ) -> Result<(tonic::Response<MessageStream>, oneshot::Receiver<Error>)> {
        let (requests, errors) = self.requests.clone().stream(frames);
        let response = self
            .downstream
            .streaming(self.binding.method(), self.request(requests))
            .await?;
        Ok((response, errors))
    }

    /// Marshal a response message, projected through `response_body`
    fn encode(&self, message: &DynamicMessage) -> Result<Vec<u8>> {
        let result = match self.binding.response_body().map(|path| (path, path.leaf())) {
            Some((path, Some(leaf))) => path
                .parents()
                .iter()
                .try_fold(Cow::Borrowed(message), |current, component| {
                    let next = current.get_field(&component.target).as_message().cloned();
                    next.map(Cow::Owned).ok_or_else(|| {
                        Error::outbound(format!("{} is not a message field", component.name))
                    })
                })
                .and_then(|parent| self.outbound.marshal_field(&parent, &leaf.target)),
            _ => self.outbound.marshal(message),
        };
        if let Err(e) = &result {
            error!(selector = self.binding.selector(), error = %e, "failed to marshal response");
        }
        result
    }

    fn unary_response(&self, response: tonic::Response<DynamicMessage>) -> Result<Response> {
        let (metadata, message, _) = response.into_parts();
        let payload = self.encode(&message)?;
        let mut response = Response::new(Body::from(payload));
        set_content_type(&mut response, self.outbound.content_type());
        forward_metadata(response.headers_mut(), &metadata, &self.header_matcher);
        Ok(response)
    }

    /// Hand the response stream to a background task feeding `conn` and
    /// return the HTTP response it writes into.
    fn start_stream(
        self,
        mut conn: Box<dyn StreamConnection>,
        mut response: Response,
        upstream: tonic::Response<MessageStream>,
        errors: Option<oneshot::Receiver<Error>>,
    ) -> Response {
        let (metadata, responses, _) = upstream.into_parts();
        forward_metadata(response.headers_mut(), &metadata, &self.header_matcher);
        tokio::spawn(async move {
            self.forward(conn.as_mut(), responses, errors).await;
        });
        response
    }

    /// Pump responses into `conn` until either side is done. Dropping
    /// `responses` early cancels the downstream call.
    async fn forward(
        &self,
        conn: &mut dyn StreamConnection,
        mut responses: MessageStream,
        mut errors: Option<oneshot::Receiver<Error>>,
    ) {
        let selector = self.binding.selector();
        loop {
            let item = tokio::select! {
                item = responses.next() => item,
                _ = conn.closed() => {
                    debug!(selector, "client went away, cancelling stream");
                    return;
                }
            };

            match item {
                Some(Ok(message)) => {
                    let payload = match self.encode(&message) {
                        Ok(payload) => payload,
                        Err(e) => {
                            conn.close(Some(&e.to_error_body())).await;
                            return;
                        }
                    };
                    if !conn.send(&payload).await {
                        debug!(selector, "client went away, cancelling stream");
                        return;
                    }
                }
                Some(Err(status)) => {
                    warn!(
                        selector,
                        code = ?status.code(),
                        message = status.message(),
                        "stream failed after response started"
                    );
                    conn.close(Some(&ErrorBody::from_status(&status))).await;
                    return;
                }
                None => break,
            }
        }

        let failure = errors.as_mut().and_then(|rx| rx.try_recv().ok());
        if let Some(err) = &failure {
            warn!(selector, error = %err, "request stream failed");
        }
        conn.close(failure.map(|e| e.to_error_body()).as_ref()).await;
    }

    async fn serve_websocket(self, socket: WebSocket) {
        let mut conn = WebSocketConnection::new(socket);
        let selector = self.binding.selector();
        debug!(selector, "websocket established");

        let outcome = match self.binding.kind() {
            MethodKind::ServerStreaming => {
                let payload = if self.binding.body().is_some() {
                    conn.receive().await.unwrap_or_else(|| Ok(Vec::new()))
                } else {
                    Ok(Vec::new())
                };
                // later request frames are not read
                drop(conn.take_incoming());
                match payload {
                    Ok(payload) => self
                        .server_streaming(&payload)
                        .await
                        .map(|response| (response.into_inner(), None)),
                    Err(e) => Err(e),
                }
            }
            MethodKind::ClientStreaming => {
                let incoming = conn.take_incoming();
                let result = tokio::select! {
                    result = self.client_streaming(incoming) => result,
                    _ = conn.closed() => {
                        debug!(selector, "client went away, cancelling stream");
                        return;
                    }
                };
                let payload = result.and_then(|response| self.encode(response.get_ref()));
                match payload {
                    Ok(payload) => {
                        if conn.send(&payload).await {
                            conn.close(None).await;
                        } else {
                            let e = Error::Connection(
                                "websocket closed before the response was sent".into(),
                            );
                            warn!(selector, error = %e, "websocket call failed");
                        }
                    }
                    Err(e) => {
                        warn!(selector, error = %e, "websocket call failed");
                        conn.close(Some(&e.to_error_body())).await;
                    }
                }
                return;
            }
            MethodKind::BidiStreaming => self
                .bidi(conn.take_incoming())
                .await
                .map(|(response, errors)| (response.into_inner(), Some(errors))),
            MethodKind::Unary => Err(Error::StreamingMethodNotAllowed("websocket".into())),
        };

        match outcome {
            Ok((responses, errors)) => self.forward(&mut conn, responses, errors).await,
            Err(e) => {
                warn!(selector, error = %e, "websocket call failed");
                conn.close(Some(&e.to_error_body())).await;
            }
        }
    }
}

fn open_connection(
    mode: DeliveryMode,
    incoming: FrameStream,
    marshaler: Arc<dyn Marshaler>,
) -> (Box<dyn StreamConnection>, Response) {
    match mode {
        DeliveryMode::ServerSentEvents => {
            let (conn, response) = SseConnection::open(incoming, marshaler);
            (Box::new(conn), response)
        }
        _ => {
            let (conn, response) = ChunkedConnection::open(incoming, marshaler);
            (Box::new(conn), response)
        }
    }
}

async fn read_body(body: Body, binding: &Binding, limit: usize) -> Result<Bytes> {
    if binding.body().is_none() {
        return Ok(Bytes::new());
    }
    let mut data = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(Error::inbound)?;
        if buf.len() + chunk.len() > limit {
            return Err(Error::PayloadTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn set_content_type(response: &mut Response, content_type: &str) {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
}

fn insert_metadata(metadata: &mut MetadataMap, key: &str, value: &HeaderValue) {
    let key = key.to_ascii_lowercase();
    if key.ends_with("-bin") {
        let decoded = STANDARD
            .decode(value.as_bytes())
            .or_else(|_| STANDARD_NO_PAD.decode(value.as_bytes()));
        match (MetadataKey::<Binary>::from_bytes(key.as_bytes()), decoded) {
            (Ok(key), Ok(bytes)) => {
                metadata.append_bin(key, MetadataValue::from_bytes(&bytes));
            }
            _ => warn!(key, "dropping binary header that is not valid metadata"),
        }
        return;
    }

    match (
        MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
        MetadataValue::<Ascii>::try_from(value.as_bytes()),
    ) {
        (Ok(key), Ok(value)) => {
            metadata.append(key, value);
        }
        _ => warn!(key, "dropping header that is not valid metadata"),
    }
}

fn forward_metadata(headers: &mut HeaderMap, metadata: &MetadataMap, matcher: &HeaderMatcher) {
    for entry in metadata.iter() {
        let (key, value) = match entry {
            KeyAndValueRef::Ascii(key, value) => (key.as_str(), value.as_encoded_bytes()),
            KeyAndValueRef::Binary(key, value) => (key.as_str(), value.as_encoded_bytes()),
        };
        let Some(name) = matcher(key) else {
            continue;
        };
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(key, "dropping response metadata that is not a valid header"),
        }
    }
}

/// Read the `Grpc-Timeout` header, `<digits><H|M|S|m|u|n>`
fn grpc_timeout(headers: &HeaderMap) -> Result<Option<Duration>> {
    let Some(raw) = headers.get(GRPC_TIMEOUT) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(parse_grpc_timeout)
        .map(Some)
        .ok_or_else(|| {
            Error::Grpc(tonic::Status::invalid_argument(format!(
                "invalid grpc-timeout: {raw:?}"
            )))
        })
}

fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
