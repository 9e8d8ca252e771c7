//! Content-type marshalers and MIME negotiation.

use crate::error::{Error, ErrorBody, Result};
use axum::http::{header, HeaderMap};
use prost::Message;
use prost_reflect::{
    DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor,
    ReflectMessage, SerializeOptions,
};
use std::collections::HashMap;
use std::sync::Arc;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROTO_CONTENT_TYPE: &str = "application/x-protobuf";

/// How consecutive messages are separated on a streamed body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One message per line
    Newline,
    /// A flag byte (0 = message, 1 = error) and a big-endian `u32` length
    /// before every message
    LengthPrefixed,
}

/// Converts messages to and from one wire representation.
///
/// Request decoding failures are reported as inbound marshal errors and
/// response encoding failures as outbound ones.
pub trait Marshaler: Send + Sync {
    /// MIME type written in the `Content-Type` of responses
    fn content_type(&self) -> &str;

    fn marshal(&self, message: &DynamicMessage) -> Result<Vec<u8>>;

    fn unmarshal(&self, data: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage>;

    /// Encode the value of a single `field` of `parent`
    fn marshal_field(&self, parent: &DynamicMessage, field: &FieldDescriptor) -> Result<Vec<u8>>;

    /// Decode `data` as the value of `field` and store it in `parent`
    fn unmarshal_field(
        &self,
        data: &[u8],
        parent: &mut DynamicMessage,
        field: &FieldDescriptor,
    ) -> Result<()>;

    fn marshal_error(&self, body: &ErrorBody) -> Result<Vec<u8>>;

    fn framing(&self) -> Framing {
        Framing::Newline
    }

    /// One element of a chunked response, delimiter included
    fn stream_message(&self, payload: &[u8]) -> Vec<u8>;

    /// Terminal element of a chunked response that failed mid-stream
    fn stream_error(&self, body: &ErrorBody) -> Result<Vec<u8>>;
}

/// JSON mapping of protobuf messages
#[derive(Debug, Clone)]
pub struct JsonMarshaler {
    use_proto_names: bool,
    emit_unpopulated: bool,
    use_enum_numbers: bool,
    discard_unknown: bool,
}

impl Default for JsonMarshaler {
    fn default() -> Self {
        Self {
            use_proto_names: false,
            emit_unpopulated: true,
            use_enum_numbers: false,
            discard_unknown: true,
        }
    }
}

impl JsonMarshaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `snake_case` proto field names instead of `lowerCamelCase`
    pub fn use_proto_names(mut self, enabled: bool) -> Self {
        self.use_proto_names = enabled;
        self
    }

    /// Emit fields that hold their default value
    pub fn emit_unpopulated(mut self, enabled: bool) -> Self {
        self.emit_unpopulated = enabled;
        self
    }

    pub fn use_enum_numbers(mut self, enabled: bool) -> Self {
        self.use_enum_numbers = enabled;
        self
    }

    /// Silently drop unknown fields in request bodies instead of failing
    pub fn discard_unknown(mut self, enabled: bool) -> Self {
        self.discard_unknown = enabled;
        self
    }

    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions::new()
            .use_proto_field_name(self.use_proto_names)
            .skip_default_fields(!self.emit_unpopulated)
            .use_enum_numbers(self.use_enum_numbers)
    }

    fn deserialize_options(&self) -> DeserializeOptions {
        DeserializeOptions::new().deny_unknown_fields(!self.discard_unknown)
    }

    fn to_value(&self, message: &DynamicMessage, options: &SerializeOptions) -> Result<serde_json::Value> {
        message
            .serialize_with_options(serde_json::value::Serializer, options)
            .map_err(Error::outbound)
    }
}

impl Marshaler for JsonMarshaler {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn marshal(&self, message: &DynamicMessage) -> Result<Vec<u8>> {
        let mut serializer = serde_json::Serializer::new(Vec::new());
        message
            .serialize_with_options(&mut serializer, &self.serialize_options())
            .map_err(Error::outbound)?;
        Ok(serializer.into_inner())
    }

    fn unmarshal(&self, data: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(DynamicMessage::new(desc));
        }
        let mut deserializer = serde_json::Deserializer::from_slice(data);
        let message =
            DynamicMessage::deserialize_with_options(desc, &mut deserializer, &self.deserialize_options())
                .map_err(Error::inbound)?;
        deserializer.end().map_err(Error::inbound)?;
        Ok(message)
    }

    fn marshal_field(&self, parent: &DynamicMessage, field: &FieldDescriptor) -> Result<Vec<u8>> {
        let mut single = DynamicMessage::new(parent.descriptor());
        single.set_field(field, parent.get_field(field).into_owned());

        let options = self.serialize_options().skip_default_fields(false);
        let mut value = self.to_value(&single, &options)?;
        let key = if self.use_proto_names {
            field.name()
        } else {
            field.json_name()
        };
        let inner = value
            .get_mut(key)
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        serde_json::to_vec(&inner).map_err(Error::outbound)
    }

    fn unmarshal_field(
        &self,
        data: &[u8],
        parent: &mut DynamicMessage,
        field: &FieldDescriptor,
    ) -> Result<()> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: serde_json::Value = serde_json::from_slice(data).map_err(Error::inbound)?;
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(field.json_name().to_string(), value);
        let single = DynamicMessage::deserialize_with_options(
            parent.descriptor(),
            serde_json::Value::Object(wrapped),
            &self.deserialize_options(),
        )
        .map_err(Error::inbound)?;
        parent.set_field(field, single.get_field(field).into_owned());
        Ok(())
    }

    fn marshal_error(&self, body: &ErrorBody) -> Result<Vec<u8>> {
        serde_json::to_vec(body).map_err(Error::outbound)
    }

    fn stream_message(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 12);
        out.extend_from_slice(br#"{"result":"#);
        out.extend_from_slice(payload);
        out.extend_from_slice(b"}\n");
        out
    }

    fn stream_error(&self, body: &ErrorBody) -> Result<Vec<u8>> {
        let mut out = br#"{"error":"#.to_vec();
        out.extend(serde_json::to_vec(body).map_err(Error::outbound)?);
        out.extend_from_slice(b"}\n");
        Ok(out)
    }
}

/// Binary protobuf encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoMarshaler;

impl ProtoMarshaler {
    fn frame(flag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 5);
        out.push(flag);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

fn singular_message(field: &FieldDescriptor) -> Option<MessageDescriptor> {
    match field.kind() {
        Kind::Message(desc) if !field.is_list() && !field.is_map() => Some(desc),
        _ => None,
    }
}

impl Marshaler for ProtoMarshaler {
    fn content_type(&self) -> &str {
        PROTO_CONTENT_TYPE
    }

    fn marshal(&self, message: &DynamicMessage) -> Result<Vec<u8>> {
        Ok(message.encode_to_vec())
    }

    fn unmarshal(&self, data: &[u8], desc: MessageDescriptor) -> Result<DynamicMessage> {
        DynamicMessage::decode(desc, data).map_err(Error::inbound)
    }

    fn marshal_field(&self, parent: &DynamicMessage, field: &FieldDescriptor) -> Result<Vec<u8>> {
        if singular_message(field).is_none() {
            return Err(Error::outbound(format!(
                "field {} is not a message and has no binary encoding of its own",
                field.name()
            )));
        }
        let value = parent.get_field(field);
        let message = value
            .as_message()
            .ok_or_else(|| Error::outbound(format!("field {} is not a message", field.name())))?;
        Ok(message.encode_to_vec())
    }

    fn unmarshal_field(
        &self,
        data: &[u8],
        parent: &mut DynamicMessage,
        field: &FieldDescriptor,
    ) -> Result<()> {
        let desc = singular_message(field).ok_or_else(|| {
            Error::inbound(format!(
                "field {} is not a message and has no binary encoding of its own",
                field.name()
            ))
        })?;
        let message = DynamicMessage::decode(desc, data).map_err(Error::inbound)?;
        parent.set_field(field, prost_reflect::Value::Message(message));
        Ok(())
    }

    fn marshal_error(&self, body: &ErrorBody) -> Result<Vec<u8>> {
        Ok(body.encode_to_vec())
    }

    fn framing(&self) -> Framing {
        Framing::LengthPrefixed
    }

    fn stream_message(&self, payload: &[u8]) -> Vec<u8> {
        Self::frame(0, payload)
    }

    fn stream_error(&self, body: &ErrorBody) -> Result<Vec<u8>> {
        Ok(Self::frame(1, &body.encode_to_vec()))
    }
}

/// Marshalers keyed by MIME type, with a wildcard fallback
#[derive(Clone)]
pub struct MarshalerRegistry {
    by_mime: HashMap<String, Arc<dyn Marshaler>>,
    fallback: Arc<dyn Marshaler>,
}

impl Default for MarshalerRegistry {
    fn default() -> Self {
        let json: Arc<dyn Marshaler> = Arc::new(JsonMarshaler::default());
        let mut registry = Self {
            by_mime: HashMap::new(),
            fallback: json.clone(),
        };
        registry.insert(JSON_CONTENT_TYPE, json);
        registry.insert(PROTO_CONTENT_TYPE, Arc::new(ProtoMarshaler));
        registry
    }
}

impl MarshalerRegistry {
    /// Register `marshaler` for `mime`; `"*"` replaces the fallback.
    pub fn insert(&mut self, mime: impl AsRef<str>, marshaler: Arc<dyn Marshaler>) {
        let mime = normalize(mime.as_ref());
        if mime == "*" {
            self.fallback = marshaler;
        } else {
            self.by_mime.insert(mime, marshaler);
        }
    }

    /// Marshaler registered for exactly `mime` (parameters ignored)
    pub fn get(&self, mime: &str) -> Option<Arc<dyn Marshaler>> {
        self.by_mime.get(&normalize(mime)).cloned()
    }

    pub fn fallback(&self) -> Arc<dyn Marshaler> {
        self.fallback.clone()
    }

    /// Pick the inbound marshaler from `Content-Type` and the outbound one
    /// from the first `Accept` entry that has a registered marshaler,
    /// falling back to the inbound one.
    pub fn negotiate(&self, headers: &HeaderMap) -> (Arc<dyn Marshaler>, Arc<dyn Marshaler>) {
        let inbound = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| self.get(ct))
            .unwrap_or_else(|| self.fallback());

        let outbound = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .find_map(|mime| self.get(mime))
            .unwrap_or_else(|| inbound.clone());

        (inbound, outbound)
    }
}

fn normalize(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{message, pool};
    use axum::http::HeaderValue;
    use prost_reflect::Value;

    fn sample() -> DynamicMessage {
        let pool = pool();
        let mut msg = DynamicMessage::new(message(&pool, "SimpleMessage"));
        msg.set_field_by_name("id", Value::String("abc".into()));
        msg.set_field_by_name("num", Value::I64(7));
        msg.set_field_by_name("tags", Value::List(vec![Value::String("x".into())]));
        msg
    }

    #[test]
    fn json_uses_camel_case_and_emits_defaults() {
        let json = JsonMarshaler::default();
        let bytes = json.marshal(&sample()).expect("marshal");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

        assert_eq!(value["id"], "abc");
        assert_eq!(value["num"], "7");
        assert_eq!(value["noteDetails"], serde_json::Value::Null);
        assert_eq!(value["flag"], false);

        let proto_names = JsonMarshaler::default()
            .use_proto_names(true)
            .emit_unpopulated(false);
        let bytes = proto_names.marshal(&sample()).expect("marshal");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert!(value.get("flag").is_none());
        assert_eq!(value["tags"][0], "x");
    }

    #[test]
    fn json_unmarshal_reports_inbound_errors() {
        let pool = pool();
        let desc = message(&pool, "SimpleMessage");
        let json = JsonMarshaler::default();

        let msg = json
            .unmarshal(br#"{"id": "abc", "noteDetails": {"text": "t"}, "bogus": 1}"#, desc.clone())
            .expect("unknown fields are dropped");
        assert_eq!(msg.get_field_by_name("id").expect("id").as_str(), Some("abc"));

        let strict = JsonMarshaler::default().discard_unknown(false);
        let err = strict
            .unmarshal(br#"{"bogus": 1}"#, desc.clone())
            .expect_err("unknown field");
        assert!(matches!(
            err,
            Error::Marshal {
                direction: crate::error::Direction::Inbound,
                ..
            }
        ));

        assert!(json.unmarshal(b"{not json", desc.clone()).is_err());
        assert_eq!(
            json.unmarshal(b"  ", desc.clone()).expect("empty body"),
            DynamicMessage::new(desc)
        );
    }

    #[test]
    fn json_field_level_round_trip() {
        let json = JsonMarshaler::default();
        let msg = sample();
        let tags = msg.descriptor().get_field_by_name("tags").expect("tags");

        let bytes = json.marshal_field(&msg, &tags).expect("marshal field");
        assert_eq!(bytes, br#"["x"]"#);

        let mut target = DynamicMessage::new(msg.descriptor());
        json.unmarshal_field(br#"["a","b"]"#, &mut target, &tags)
            .expect("unmarshal field");
        assert_eq!(
            target.get_field(&tags).as_list().map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn json_stream_frames() {
        let json = JsonMarshaler::default();
        assert_eq!(json.stream_message(br#"{"a":1}"#), b"{\"result\":{\"a\":1}}\n");

        let body = ErrorBody {
            code: 13,
            message: "boom".into(),
            details: vec![],
        };
        let frame = json.stream_error(&body).expect("frame");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value["error"]["message"], "boom");
        assert_eq!(frame.last(), Some(&b'\n'));
    }

    #[test]
    fn proto_round_trip_and_framing() {
        let proto = ProtoMarshaler;
        let msg = sample();
        let bytes = proto.marshal(&msg).expect("marshal");
        assert_eq!(proto.unmarshal(&bytes, msg.descriptor()).expect("unmarshal"), msg);

        let frame = proto.stream_message(&bytes);
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &(bytes.len() as u32).to_be_bytes());
        assert_eq!(proto.framing(), Framing::LengthPrefixed);

        let tags = msg.descriptor().get_field_by_name("tags").expect("tags");
        assert!(proto.marshal_field(&msg, &tags).is_err());
    }

    #[test]
    fn negotiates_by_content_type_and_accept() {
        let registry = MarshalerRegistry::default();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html, application/x-protobuf;q=0.9"),
        );
        let (inbound, outbound) = registry.negotiate(&headers);
        assert_eq!(inbound.content_type(), JSON_CONTENT_TYPE);
        assert_eq!(outbound.content_type(), PROTO_CONTENT_TYPE);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-protobuf"),
        );
        let (inbound, outbound) = registry.negotiate(&headers);
        assert_eq!(inbound.content_type(), PROTO_CONTENT_TYPE);
        assert_eq!(outbound.content_type(), PROTO_CONTENT_TYPE);

        let (inbound, _) = registry.negotiate(&HeaderMap::new());
        assert_eq!(inbound.content_type(), JSON_CONTENT_TYPE);
    }

    #[test]
    fn wildcard_replaces_fallback() {
        let mut registry = MarshalerRegistry::default();
        registry.insert("*", Arc::new(ProtoMarshaler));
        assert_eq!(registry.fallback().content_type(), PROTO_CONTENT_TYPE);
        assert!(registry.get("text/plain").is_none());
    }
}
