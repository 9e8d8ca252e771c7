//! In-memory descriptors and a scripted downstream shared by unit tests.

use crate::grpc_client::{Downstream, MessageStream, RequestStream};
use async_trait::async_trait;
use futures::StreamExt;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, MessageOptions, MethodDescriptorProto, OneofDescriptorProto,
    ServiceDescriptorProto,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};

pub const PACKAGE: &str = "example.v1";

fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn typed(name: &str, number: i32, ty: Type, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        type_name: Some(type_name.to_string()),
        ..field(name, number, ty)
    }
}

fn repeated(mut f: FieldDescriptorProto) -> FieldDescriptorProto {
    f.label = Some(Label::Repeated as i32);
    f
}

fn in_oneof(mut f: FieldDescriptorProto, index: i32) -> FieldDescriptorProto {
    f.oneof_index = Some(index);
    f
}

fn message_type(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn map_entry(name: &str, value: FieldDescriptorProto) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![field("key", 1, Type::String), FieldDescriptorProto {
            name: Some("value".into()),
            number: Some(2),
            ..value
        }],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn rpc(name: &str, input: &str, output: &str, client: bool, server: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".{PACKAGE}.{input}")),
        output_type: Some(format!(".{PACKAGE}.{output}")),
        client_streaming: Some(client),
        server_streaming: Some(server),
        ..Default::default()
    }
}

fn fixture_file() -> FileDescriptorProto {
    let q = |name: &str| format!(".{PACKAGE}.{name}");

    let mut simple = message_type(
        "SimpleMessage",
        vec![
            field("id", 1, Type::String),
            field("num", 2, Type::Int64),
            typed("nested", 3, Type::Message, &q("Nested")),
            typed("note_details", 4, Type::Message, &q("NoteDetails")),
            repeated(typed("table", 5, Type::Message, &q("SimpleMessage.TableEntry"))),
            repeated(typed(
                "nested_map",
                6,
                Type::Message,
                &q("SimpleMessage.NestedMapEntry"),
            )),
            typed("status", 7, Type::Enum, &q("Status")),
            repeated(field("tags", 8, Type::String)),
            repeated(typed("items", 9, Type::Message, &q("Item"))),
            in_oneof(field("code_name", 10, Type::String), 0),
            in_oneof(field("code_number", 11, Type::Int32), 0),
            field("flag", 12, Type::Bool),
            field("ratio", 13, Type::Double),
            field("payload", 14, Type::Bytes),
            field("count", 15, Type::Uint32),
            typed(
                "created_at",
                16,
                Type::Message,
                ".google.protobuf.Timestamp",
            ),
            typed("limit", 17, Type::Message, ".google.protobuf.Int32Value"),
        ],
    );
    simple.nested_type = vec![
        map_entry("TableEntry", field("value", 2, Type::String)),
        map_entry(
            "NestedMapEntry",
            typed("value", 2, Type::Message, &q("Item")),
        ),
    ];
    simple.oneof_decl = vec![OneofDescriptorProto {
        name: Some("code".into()),
        ..Default::default()
    }];

    let mut item_request = message_type(
        "ItemRequest",
        vec![
            FieldDescriptorProto {
                proto3_optional: Some(true),
                ..in_oneof(field("id", 1, Type::String), 0)
            },
            field("name", 2, Type::String),
        ],
    );
    item_request.oneof_decl = vec![OneofDescriptorProto {
        name: Some("_id".into()),
        ..Default::default()
    }];

    let mut note_request = message_type(
        "NoteRequest",
        vec![
            field("id", 1, Type::String),
            typed("note_details", 2, Type::Message, &q("NoteDetails")),
            repeated(typed("table", 3, Type::Message, &q("NoteRequest.TableEntry"))),
        ],
    );
    note_request.nested_type = vec![map_entry("TableEntry", field("value", 2, Type::String))];

    let status = EnumDescriptorProto {
        name: Some("Status".into()),
        value: ["STATUS_UNSPECIFIED", "STATUS_ACTIVE", "STATUS_ARCHIVED"]
            .iter()
            .enumerate()
            .map(|(number, name)| EnumValueDescriptorProto {
                name: Some(name.to_string()),
                number: Some(number as i32),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some("example/v1/echo.proto".into()),
        package: Some(PACKAGE.into()),
        dependency: vec![
            "google/protobuf/timestamp.proto".into(),
            "google/protobuf/wrappers.proto".into(),
        ],
        message_type: vec![
            message_type(
                "Nested",
                vec![field("label", 1, Type::String), field("depth", 2, Type::Int32)],
            ),
            message_type("NoteDetails", vec![field("text", 1, Type::String)]),
            message_type("Item", vec![field("name", 1, Type::String)]),
            simple,
            item_request,
            note_request,
            message_type(
                "TreeNode",
                vec![
                    field("name", 1, Type::String),
                    typed("child", 2, Type::Message, &q("TreeNode")),
                    repeated(typed("children", 3, Type::Message, &q("TreeNode"))),
                ],
            ),
        ],
        enum_type: vec![status],
        service: vec![
            ServiceDescriptorProto {
                name: Some("EchoService".into()),
                method: vec![
                    rpc("Echo", "SimpleMessage", "SimpleMessage", false, false),
                    rpc("StreamEcho", "SimpleMessage", "SimpleMessage", false, true),
                    rpc("Collect", "SimpleMessage", "SimpleMessage", true, false),
                    rpc("Chat", "SimpleMessage", "SimpleMessage", true, true),
                    rpc("GetItem", "ItemRequest", "SimpleMessage", false, false),
                    rpc("Note", "NoteRequest", "NoteRequest", false, false),
                    rpc("Walk", "TreeNode", "TreeNode", false, false),
                ],
                ..Default::default()
            },
            ServiceDescriptorProto {
                name: Some("OtherService".into()),
                method: vec![rpc("Ping", "SimpleMessage", "SimpleMessage", false, false)],
                ..Default::default()
            },
        ],
        syntax: Some("proto3".into()),
        ..Default::default()
    }
}

/// Pool holding the well-known types plus the `example.v1` fixture file
pub fn pool() -> DescriptorPool {
    let mut pool = DescriptorPool::global();
    pool.add_file_descriptor_proto(fixture_file())
        .expect("fixture descriptors are valid");
    pool
}

/// Encoded `FileDescriptorSet` of the fixture, as a gateway would load it
pub fn descriptor_set_bytes() -> Vec<u8> {
    use prost::Message;
    prost_types::FileDescriptorSet {
        file: vec![fixture_file()],
    }
    .encode_to_vec()
}

/// Look up a fixture message by its short name
pub fn message(pool: &DescriptorPool, name: &str) -> MessageDescriptor {
    pool.get_message_by_name(&format!("{PACKAGE}.{name}"))
        .unwrap_or_else(|| panic!("message {name} exists"))
}

/// Look up a fixture method by service and method short names
pub fn method(pool: &DescriptorPool, service: &str, name: &str) -> MethodDescriptor {
    pool.get_service_by_name(&format!("{PACKAGE}.{service}"))
        .and_then(|s| s.methods().find(|m| m.name() == name))
        .unwrap_or_else(|| panic!("method {service}.{name} exists"))
}

/// Scripted downstream standing in for a real gRPC server.
///
/// * unary echoes the request and reports every incoming metadata key back
///   as `seen-<key>` response metadata
/// * server streaming yields `count` copies (default 3) of the request with
///   `num` set to the index, then `fail_after` if configured; with
///   `hold_open` set the stream then never ends, and raises the flag once the
///   gateway drops it
/// * client streaming collects every `id` into `tags` and the message count
///   into `num`
/// * bidi streaming echoes each message
#[derive(Default, Clone)]
pub struct FakeDownstream {
    pub count: Option<usize>,
    pub fail_after: Option<Status>,
    pub fail_unary: Option<Status>,
    pub hold_open: Option<Arc<AtomicBool>>,
}

/// Raises its flag when dropped along with the stream that owns it
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl FakeDownstream {
    pub fn failing(status: Status) -> Self {
        Self {
            fail_unary: Some(status.clone()),
            fail_after: Some(status),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Downstream for FakeDownstream {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> Result<Response<DynamicMessage>, Status> {
        if let Some(status) = &self.fail_unary {
            return Err(status.clone());
        }

        let mut seen = Vec::new();
        for key in request.metadata().keys() {
            if let tonic::metadata::KeyRef::Ascii(key) = key {
                seen.push(key.as_str().to_string());
            }
        }

        let message = request.into_inner();
        let mut output = DynamicMessage::new(method.output());
        output
            .transcode_from(&message)
            .map_err(|e| Status::internal(e.to_string()))?;

        let mut response = Response::new(output);
        for key in seen {
            if let Ok(name) = format!("seen-{key}").parse::<tonic::metadata::AsciiMetadataKey>() {
                response
                    .metadata_mut()
                    .insert(name, MetadataValue::from_static("1"));
            }
        }
        Ok(response)
    }

    async fn server_streaming(
        &self,
        _method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> Result<Response<MessageStream>, Status> {
        let message = request.into_inner();
        let mut items: Vec<Result<DynamicMessage, Status>> = (0..self.count.unwrap_or(3))
            .map(|idx| {
                let mut copy = message.clone();
                copy.set_field_by_name("num", Value::I64(idx as i64));
                Ok(copy)
            })
            .collect();
        if let Some(status) = &self.fail_after {
            items.push(Err(status.clone()));
        }
        let items = futures::stream::iter(items);
        match &self.hold_open {
            Some(flag) => {
                let guard = DropFlag(flag.clone());
                let pending = futures::stream::pending::<Result<DynamicMessage, Status>>()
                    .map(move |item| {
                        let _held = &guard;
                        item
                    });
                Ok(Response::new(items.chain(pending).boxed()))
            }
            None => Ok(Response::new(items.boxed())),
        }
    }

    async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> Result<Response<DynamicMessage>, Status> {
        let received: Vec<DynamicMessage> = request.into_inner().collect().await;

        let ids = received
            .iter()
            .filter_map(|m| {
                m.get_field_by_name("id")
                    .and_then(|v| v.as_str().map(|s| Value::String(s.to_string())))
            })
            .collect();

        let mut output = DynamicMessage::new(method.output());
        output.set_field_by_name("tags", Value::List(ids));
        output.set_field_by_name("num", Value::I64(received.len() as i64));
        Ok(Response::new(output))
    }

    async fn streaming(
        &self,
        _method: &MethodDescriptor,
        request: Request<RequestStream>,
    ) -> Result<Response<MessageStream>, Status> {
        let echoed = request.into_inner().map(Ok);
        Ok(Response::new(echoed.boxed()))
    }
}
