use prost_reflect::DescriptorPool;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use rpctap_http::{Direction, EnvelopeFrame};
use rpctap_proto::{decode_frame, decode_unary_body, MessageRegistry};

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(Type::String as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

fn message(name: &str) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![string_field("text", 1)],
        ..Default::default()
    }
}

/// A pool with one service wired through descriptors and a second family of
/// messages only reachable through naming conventions.
fn test_pool() -> DescriptorPool {
    let file = FileDescriptorProto {
        name: Some("tap_test.proto".to_string()),
        package: Some("tap.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            message("EchoRequest"),
            message("EchoResponse"),
            message("PushReq"),
            message("PushResp"),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("EchoService".to_string()),
            method: vec![MethodDescriptorProto {
                name: Some("Echo".to_string()),
                input_type: Some(".tap.v1.EchoRequest".to_string()),
                output_type: Some(".tap.v1.EchoResponse".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
        .expect("valid descriptor set")
}

fn registry() -> MessageRegistry {
    MessageRegistry::with_pool(test_pool())
}

// field 1, wire type 2, "hi"
const ECHO_HI: &[u8] = b"\x0a\x02hi";

#[test]
fn resolves_types_through_the_service_descriptor() {
    let registry = registry();
    registry.ensure("tap.v1.EchoService", "Echo");

    let request = registry
        .request_type("tap.v1.EchoService", "Echo")
        .expect("request descriptor");
    assert_eq!(request.full_name(), "tap.v1.EchoRequest");

    let response = registry
        .response_type("tap.v1.EchoService", "Echo")
        .expect("response descriptor");
    assert_eq!(response.full_name(), "tap.v1.EchoResponse");
}

#[test]
fn falls_back_to_naming_conventions() {
    let registry = registry();
    // No PushService exists in the pool; only tap.v1.PushReq / PushResp do.
    registry.ensure("tap.v1.PushService", "Push");

    let request = registry
        .request_type("tap.v1.PushService", "Push")
        .expect("request via convention");
    assert_eq!(request.full_name(), "tap.v1.PushReq");

    let response = registry
        .response_type("tap.v1.PushService", "Push")
        .expect("response via convention");
    assert_eq!(response.full_name(), "tap.v1.PushResp");
}

#[test]
fn unresolvable_methods_stay_absent() {
    let registry = registry();
    registry.ensure("other.v1.Nothing", "Missing");
    assert!(registry.request_type("other.v1.Nothing", "Missing").is_none());
    assert!(registry.response_type("other.v1.Nothing", "Missing").is_none());
}

#[test]
fn decodes_request_frame_to_canonical_json() {
    let registry = registry();
    let frame = EnvelopeFrame {
        compressed: false,
        payload: ECHO_HI.to_vec(),
    };
    let message = decode_frame(
        &frame,
        "tap.v1.EchoService",
        "Echo",
        Direction::ClientToServer,
        &registry,
    );
    assert_eq!(message.json.as_deref(), Some("{\"text\":\"hi\"}"));
    assert!(message.error.is_none());
    assert!(message.raw.is_none());
}

#[test]
fn unset_fields_are_dropped_from_the_rendering() {
    let registry = registry();
    let message = decode_unary_body(
        // zero-length proto3 message: all fields at defaults
        b"",
        "tap.v1.EchoService",
        "Echo",
        Direction::ServerToClient,
        &registry,
    );
    assert_eq!(message.json.as_deref(), Some("{}"));
}

#[test]
fn compressed_frame_decodes_after_gunzip() {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(ECHO_HI).expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");

    let registry = registry();
    let message = decode_frame(
        &EnvelopeFrame {
            compressed: true,
            payload: compressed,
        },
        "tap.v1.EchoService",
        "Echo",
        Direction::ClientToServer,
        &registry,
    );
    assert!(message.compressed);
    assert_eq!(message.json.as_deref(), Some("{\"text\":\"hi\"}"));
}

#[test]
fn garbage_payload_reports_unmarshal_error_and_keeps_raw() {
    let registry = registry();
    let payload = b"\xff\xff\xff";
    let message = decode_frame(
        &EnvelopeFrame {
            compressed: false,
            payload: payload.to_vec(),
        },
        "tap.v1.EchoService",
        "Echo",
        Direction::ClientToServer,
        &registry,
    );
    let error = message.error.expect("unmarshal error");
    assert!(error.starts_with("unmarshal error:"), "{error}");
    assert_eq!(message.raw.as_deref(), Some(&payload[..]));
}

#[test]
fn explicit_register_overrides_lazy_resolution() {
    let registry = registry();
    let swapped = registry
        .message_by_name("tap.v1.PushResp")
        .expect("descriptor");
    registry.register("tap.v1.EchoService", "Echo", Some(swapped), None);

    let request = registry
        .request_type("tap.v1.EchoService", "Echo")
        .expect("request descriptor");
    assert_eq!(request.full_name(), "tap.v1.PushResp");
    // The pre-marked attempt means ensure() must not overwrite it.
    registry.ensure("tap.v1.EchoService", "Echo");
    let request_again = registry
        .request_type("tap.v1.EchoService", "Echo")
        .expect("request descriptor");
    assert_eq!(request_again.full_name(), "tap.v1.PushResp");
}
