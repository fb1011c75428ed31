mod content_decode;
mod grpc_envelope;
mod h1;
mod sse;

pub use content_decode::ContentDecoder;
pub use grpc_envelope::{
    encode_envelope, EnvelopeError, EnvelopeFrame, EnvelopeParser, MAX_ENVELOPE_PAYLOAD_LEN,
};
pub use h1::{
    BodyMode, H1Error, H1Event, H1Role, HeaderField, MessageAssembler, MessageHead,
    DEFAULT_MAX_HEAD_BYTES,
};
pub use sse::{SseEvent, SseParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "C2S",
            Self::ServerToClient => "S2C",
        }
    }
}

/// Shape of a gRPC / Connect-Protocol body, derived from the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrpcContentType {
    /// `application/grpc` and subtypes: length-prefixed framing.
    pub grpc: bool,
    /// `application/proto`: one raw protobuf message, no framing.
    pub connect_unary_proto: bool,
    /// `application/connect+proto`: Connect streaming, envelope framing.
    pub connect_stream_proto: bool,
    /// `application/connect+json`: Connect JSON, decoded as a UTF-8 JSON body.
    pub connect_json: bool,
}

impl GrpcContentType {
    pub fn is_grpc_like(self) -> bool {
        self.grpc || self.connect_unary_proto || self.connect_stream_proto || self.connect_json
    }

    pub fn has_envelope_framing(self) -> bool {
        self.grpc || self.connect_stream_proto
    }
}

pub fn classify_grpc_content_type(content_type: &str) -> GrpcContentType {
    let ct = content_type.trim().to_ascii_lowercase();
    GrpcContentType {
        grpc: ct.starts_with("application/grpc"),
        connect_unary_proto: ct == "application/proto" || ct.starts_with("application/proto;"),
        connect_stream_proto: ct.starts_with("application/connect+proto"),
        connect_json: ct.starts_with("application/connect+json"),
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/event-stream")
}
