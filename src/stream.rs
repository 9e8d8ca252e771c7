//! Streaming delivery: chunked transfer, server-sent events and websockets.
//!
//! Every transport is exposed through [`StreamConnection`], so the dispatcher
//! drives a streaming RPC the same way whichever mode was negotiated.

use crate::error::{Error, ErrorBody, Result};
use crate::marshal::{Framing, Marshaler};
use crate::types::StreamConfig;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{self, BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Content type announced for event streams
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Frames buffered between the RPC and a slow HTTP client
const CHANNEL_CAPACITY: usize = 16;

/// Websocket close reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 123;

/// Raw request frames, ended by end of input
pub type FrameStream = BoxStream<'static, Result<Vec<u8>>>;

/// How the responses of a streaming binding reach the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    WebSocket,
    ServerSentEvents,
    Chunked,
}

/// Choose the delivery mode for a request.
///
/// A websocket upgrade wins, then an `Accept: text/event-stream`, then plain
/// chunked transfer. An event stream the binding does not offer degrades to
/// chunked transfer; a refused upgrade cannot, and fails.
pub fn negotiate(headers: &HeaderMap, config: &StreamConfig) -> Result<DeliveryMode> {
    if is_websocket_upgrade(headers) {
        return if config.allow_websocket {
            Ok(DeliveryMode::WebSocket)
        } else {
            Err(Error::StreamingMethodNotAllowed("websocket".into()))
        };
    }

    if config.allow_sse && accepts_event_stream(headers) {
        return Ok(DeliveryMode::ServerSentEvents);
    }

    if config.allow_chunked_transfer {
        Ok(DeliveryMode::Chunked)
    } else if accepts_event_stream(headers) {
        Err(Error::StreamingMethodNotAllowed("server-sent events".into()))
    } else {
        Err(Error::StreamingMethodNotAllowed("chunked transfer".into()))
    }
}

/// True for an HTTP/1.1 `Upgrade: websocket` handshake
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|mime| {
            mime.split(';')
                .next()
                .is_some_and(|m| m.trim().eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE))
        })
}

/// One open streaming exchange with a client.
///
/// Once the peer has gone away `send` reports `false` instead of failing,
/// and `close` may be called any number of times.
#[async_trait]
pub trait StreamConnection: Send {
    /// Next request frame, `None` at end of input
    async fn receive(&mut self) -> Option<Result<Vec<u8>>>;

    /// Hand the remaining request frames to another consumer, leaving this
    /// connection free to send while they are read.
    fn take_incoming(&mut self) -> FrameStream;

    /// Deliver one encoded response message
    async fn send(&mut self, payload: &[u8]) -> bool;

    /// End the stream, reporting `error` in-band when given
    async fn close(&mut self, error: Option<&ErrorBody>);

    /// Resolves once the client can no longer receive responses
    async fn closed(&mut self);
}

/// Request frames not yet handed out
struct Incoming(Option<FrameStream>);

impl Incoming {
    async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        self.0.as_mut()?.next().await
    }

    fn take(&mut self) -> FrameStream {
        self.0.take().unwrap_or_else(|| stream::empty().boxed())
    }
}

/// Split a request body into frames according to `framing`.
///
/// Newline framing skips blank lines and accepts a final line without a
/// terminator. Length-prefixed framing fails on a truncated frame. A frame
/// larger than `limit` bytes fails the stream.
pub fn body_frames(body: Body, framing: Framing, limit: usize) -> FrameStream {
    let data = body.into_data_stream().boxed();
    stream::unfold(
        (data, Vec::new(), false),
        move |(mut data, mut buf, mut eof)| async move {
            loop {
                match split_frame(&mut buf, framing, eof) {
                    Ok(Some(frame)) if frame.len() > limit => {
                        let err = Error::PayloadTooLarge(limit);
                        return Some((Err(err), (data, Vec::new(), true)));
                    }
                    Ok(Some(frame)) => return Some((Ok(frame), (data, buf, eof))),
                    Ok(None) if eof => return None,
                    Ok(None) if pending_len(&buf, framing) > limit => {
                        let err = Error::PayloadTooLarge(limit);
                        return Some((Err(err), (data, Vec::new(), true)));
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (data, Vec::new(), true))),
                }
                match data.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(Error::inbound(e)), (data, Vec::new(), true))),
                    None => eof = true,
                }
            }
        },
    )
    .boxed()
}

/// Size of the incomplete frame at the head of `buf`
fn pending_len(buf: &[u8], framing: Framing) -> usize {
    match framing {
        Framing::Newline => buf.len(),
        Framing::LengthPrefixed if buf.len() >= 5 => {
            u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize
        }
        Framing::LengthPrefixed => 0,
    }
}

fn split_frame(buf: &mut Vec<u8>, framing: Framing, eof: bool) -> Result<Option<Vec<u8>>> {
    match framing {
        Framing::Newline => {
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if !line.is_empty() {
                    return Ok(Some(line.to_vec()));
                }
            }
            if eof {
                let rest = std::mem::take(buf);
                let rest = rest.trim_ascii();
                if !rest.is_empty() {
                    return Ok(Some(rest.to_vec()));
                }
            }
            Ok(None)
        }
        Framing::LengthPrefixed => {
            if buf.len() >= 5 {
                let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
                if buf.len() >= 5 + len {
                    let frame = buf[5..5 + len].to_vec();
                    buf.drain(..5 + len);
                    return Ok(Some(frame));
                }
            }
            if eof && !buf.is_empty() {
                buf.clear();
                return Err(Error::inbound("truncated length-prefixed frame"));
            }
            Ok(None)
        }
    }
}

/// Render `payload` as event data: text as-is, anything else base64
fn event_data(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.replace('\r', ""),
        Err(_) => BASE64.encode(payload),
    }
}

/// Framed messages over a chunked HTTP response body
pub struct ChunkedConnection {
    incoming: Incoming,
    tx: Option<mpsc::Sender<Bytes>>,
    marshaler: Arc<dyn Marshaler>,
}

impl ChunkedConnection {
    /// Open a connection and the response whose body it feeds
    pub fn open(incoming: FrameStream, marshaler: Arc<dyn Marshaler>) -> (Self, Response) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

        let mut response = body.into_response();
        if let Ok(value) = HeaderValue::from_str(marshaler.content_type()) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }

        let conn = Self {
            incoming: Incoming(Some(incoming)),
            tx: Some(tx),
            marshaler,
        };
        (conn, response)
    }
}

#[async_trait]
impl StreamConnection for ChunkedConnection {
    async fn receive(&mut self) -> Option<Result<Vec<u8>>> {
        self.incoming.next().await
    }

    fn take_incoming(&mut self) -> FrameStream {
        self.incoming.take()
    }

    async fn send(&mut self, payload: &[u8]) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let frame = self.marshaler.stream_message(payload);
        if tx.send(Bytes::from(frame)).await.is_err() {
            debug!("chunked response receiver dropped");
            self.tx = None;
            return false;
        }
        true
    }

    async fn closed(&mut self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn close(&mut self, error: Option<&ErrorBody>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if let Some(body) = error {
            match self.marshaler.stream_error(body) {
                Ok(frame) => {
                    let _ = tx.send(Bytes::from(frame)).await;
                }
                Err(e) => warn!(error = %e, "failed to encode stream error frame"),
            }
        }
    }
}

/// `data:` events over a `text/event-stream` response
pub struct SseConnection {
    incoming: Incoming,
    tx: Option<mpsc::Sender<Event>>,
    marshaler: Arc<dyn Marshaler>,
}

impl SseConnection {
    pub fn open(incoming: FrameStream, marshaler: Arc<dyn Marshaler>) -> (Self, Response) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let events = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        let response = Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();

        let conn = Self {
            incoming: Incoming(Some(incoming)),
            tx: Some(tx),
            marshaler,
        };
        (conn, response)
    }
}

#[async_trait]
impl StreamConnection for SseConnection {
    async fn receive(&mut self) -> Option<Result<Vec<u8>>> {
        self.incoming.next().await
    }

    fn take_incoming(&mut self) -> FrameStream {
        self.incoming.take()
    }

    async fn send(&mut self, payload: &[u8]) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let event = Event::default().data(event_data(payload));
        if tx.send(event).await.is_err() {
            debug!("event stream receiver dropped");
            self.tx = None;
            return false;
        }
        true
    }

    async fn closed(&mut self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn close(&mut self, error: Option<&ErrorBody>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if let Some(body) = error {
            match self.marshaler.marshal_error(body) {
                Ok(data) => {
                    let event = Event::default().event("error").data(event_data(&data));
                    let _ = tx.send(event).await;
                }
                Err(e) => warn!(error = %e, "failed to encode stream error event"),
            }
        }
    }
}

/// One websocket message per request and per response.
///
/// An empty text or binary message ends the request stream while keeping the
/// socket open for the remaining responses. A close frame, end of stream or a
/// read error means the client is gone, and [`StreamConnection::closed`]
/// resolves.
pub struct WebSocketConnection {
    incoming: Incoming,
    sink: SplitSink<WebSocket, Message>,
    gone: watch::Receiver<bool>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, messages) = socket.split();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (gone_tx, gone) = watch::channel(false);
        let reader = tokio::spawn(read_messages(messages, tx, gone_tx));

        Self {
            incoming: Incoming(Some(ReceiverStream::new(rx).boxed())),
            sink,
            gone,
            reader,
            closed: false,
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Reads the socket until the peer leaves, feeding request frames to `tx`
/// until end of input
async fn read_messages(
    mut messages: SplitStream<WebSocket>,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    gone: watch::Sender<bool>,
) {
    let mut tx = Some(tx);
    while let Some(message) = messages.next().await {
        let data = match message {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };

        if data.is_empty() {
            if tx.take().is_some() {
                debug!("websocket request stream ended");
            }
            continue;
        }
        match &tx {
            Some(sender) => {
                if sender.send(Ok(data)).await.is_err() {
                    tx = None;
                }
            }
            None => debug!("dropping websocket frame after end of input"),
        }
    }
    let _ = gone.send(true);
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn receive(&mut self) -> Option<Result<Vec<u8>>> {
        self.incoming.next().await
    }

    fn take_incoming(&mut self) -> FrameStream {
        self.incoming.take()
    }

    async fn send(&mut self, payload: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(Bytes::copy_from_slice(payload)),
        };
        if let Err(e) = self.sink.send(message).await {
            debug!(error = %e, "websocket peer went away");
            self.closed = true;
            return false;
        }
        true
    }

    async fn closed(&mut self) {
        // a dropped sender means the reader is gone as well
        let _ = self.gone.wait_for(|gone| *gone).await;
    }

    async fn close(&mut self, error: Option<&ErrorBody>) {
        if self.closed {
            return;
        }
        self.closed = true;

        let frame = match error {
            Some(body) => CloseFrame {
                code: close_code::ERROR,
                reason: truncate(&body.message, MAX_CLOSE_REASON).into(),
            },
            None => CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            },
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "websocket already closed");
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{JsonMarshaler, ProtoMarshaler};
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn negotiation_prefers_websocket_then_sse() {
        let all = StreamConfig::default();
        let upgrade = headers(&[
            (header::CONNECTION, "keep-alive, Upgrade"),
            (header::UPGRADE, "websocket"),
        ]);
        assert_eq!(negotiate(&upgrade, &all).ok(), Some(DeliveryMode::WebSocket));

        let sse = headers(&[(header::ACCEPT, "text/event-stream")]);
        assert_eq!(negotiate(&sse, &all).ok(), Some(DeliveryMode::ServerSentEvents));

        assert_eq!(
            negotiate(&HeaderMap::new(), &all).ok(),
            Some(DeliveryMode::Chunked)
        );
    }

    #[test]
    fn negotiation_respects_disabled_transports() {
        let no_ws = StreamConfig {
            allow_websocket: false,
            ..StreamConfig::default()
        };
        let upgrade = headers(&[(header::CONNECTION, "upgrade"), (header::UPGRADE, "websocket")]);
        assert!(matches!(
            negotiate(&upgrade, &no_ws),
            Err(Error::StreamingMethodNotAllowed(_))
        ));

        let no_sse = StreamConfig {
            allow_sse: false,
            ..StreamConfig::default()
        };
        let sse = headers(&[(header::ACCEPT, "text/event-stream")]);
        assert_eq!(negotiate(&sse, &no_sse).ok(), Some(DeliveryMode::Chunked));

        let sse_only = StreamConfig {
            allow_websocket: false,
            allow_sse: true,
            allow_chunked_transfer: false,
        };
        let err = negotiate(&HeaderMap::new(), &sse_only).expect_err("no chunked");
        assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn splits_newline_frames() {
        let body = Body::from("{\"id\":\"a\"}\n\n  {\"id\":\"b\"}\r\n{\"id\":\"c\"}");
        let frames: Vec<_> = body_frames(body, Framing::Newline, usize::MAX).collect().await;
        let frames: Vec<Vec<u8>> = frames.into_iter().map(|f| f.expect("frame")).collect();
        assert_eq!(
            frames,
            vec![
                b"{\"id\":\"a\"}".to_vec(),
                b"{\"id\":\"b\"}".to_vec(),
                b"{\"id\":\"c\"}".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn splits_length_prefixed_frames() {
        let proto = ProtoMarshaler;
        let mut data = proto.stream_message(b"abc");
        data.extend(proto.stream_message(b""));
        data.extend(proto.stream_message(b"de"));

        let frames: Vec<_> = body_frames(Body::from(data), Framing::LengthPrefixed, usize::MAX)
            .collect()
            .await;
        let frames: Vec<Vec<u8>> = frames.into_iter().map(|f| f.expect("frame")).collect();
        assert_eq!(frames, vec![b"abc".to_vec(), Vec::new(), b"de".to_vec()]);

        let truncated = Body::from(vec![0u8, 0, 0, 0, 9, 1, 2]);
        let frames: Vec<_> = body_frames(truncated, Framing::LengthPrefixed, usize::MAX)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_err());
    }

    #[tokio::test]
    async fn oversized_frame_fails_the_stream() {
        let body = Body::from(format!("{{}}\n{}\n{{}}\n", "x".repeat(64)));
        let frames: Vec<_> = body_frames(body, Framing::Newline, 16).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().ok(), Some(&b"{}".to_vec()));
        assert!(matches!(frames[1], Err(Error::PayloadTooLarge(16))));

        // a length prefix over the limit fails before the payload arrives
        let announced = Body::from(vec![0u8, 0, 0, 1, 0]);
        let frames: Vec<_> = body_frames(announced, Framing::LengthPrefixed, 16)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(Error::PayloadTooLarge(16))));
    }

    #[tokio::test]
    async fn chunked_connection_frames_messages_and_errors() {
        let incoming = body_frames(Body::from("{}\n"), Framing::Newline, usize::MAX);
        let (mut conn, response) = ChunkedConnection::open(incoming, Arc::new(JsonMarshaler::default()));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );

        assert_eq!(conn.receive().await.map(|f| f.ok()), Some(Some(b"{}".to_vec())));
        assert!(conn.receive().await.is_none());

        assert!(conn.send(br#"{"id":"a"}"#).await);
        let body = ErrorBody {
            code: 14,
            message: "gone".into(),
            details: vec![],
        };
        conn.close(Some(&body)).await;
        conn.close(None).await;
        assert!(!conn.send(b"{}").await);

        let bytes = to_bytes(response.into_body(), 1024).await.expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"{"result":{"id":"a"}}"#);
        assert!(lines[1].starts_with(r#"{"error":"#));
        assert!(lines[1].contains("gone"));
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn sse_connection_emits_data_and_error_events() {
        let (mut conn, response) =
            SseConnection::open(stream::empty().boxed(), Arc::new(JsonMarshaler::default()));
        assert!(conn.send(br#"{"n":1}"#).await);
        assert!(conn.send(&[0xff, 0x00]).await);
        conn.close(Some(&ErrorBody {
            code: 13,
            message: "boom".into(),
            details: vec![],
        }))
        .await;

        let bytes = to_bytes(response.into_body(), 4096).await.expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert!(text.contains("data: {\"n\":1}\n\n"));
        assert!(text.contains(&format!("data: {}\n", BASE64.encode([0xff, 0x00]))));
        assert!(text.contains("event: error\n"));
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_reports_end_of_stream() {
        let (mut conn, response) =
            ChunkedConnection::open(stream::empty().boxed(), Arc::new(JsonMarshaler::default()));
        drop(response);
        conn.closed().await;
        assert!(!conn.send(b"{}").await);
        conn.close(None).await;
    }

    #[test]
    fn event_data_strips_carriage_returns() {
        assert_eq!(event_data(b"a\r\nb"), "a\nb");
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 123), "short");
    }
}
