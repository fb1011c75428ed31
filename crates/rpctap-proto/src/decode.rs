use std::io::Read;

use prost_reflect::DynamicMessage;
use rpctap_http::{Direction, EnvelopeFrame};

use crate::MessageRegistry;

/// A decoded (or failed-to-decode) gRPC / Connect message, ready for the
/// recorder. Exactly one of `json` and `error` is set; `raw` rides along
/// with errors so the original bytes survive for offline analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcMessage {
    pub service: String,
    pub method: String,
    pub full_method: String,
    pub direction: Direction,
    pub streaming: bool,
    pub frame_index: u32,
    pub compressed: bool,
    pub size: usize,
    pub json: Option<String>,
    pub error: Option<String>,
    pub raw: Option<Vec<u8>>,
}

impl GrpcMessage {
    pub fn new(service: &str, method: &str, direction: Direction) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            full_method: format!("/{service}/{method}"),
            direction,
            streaming: false,
            frame_index: 0,
            compressed: false,
            size: 0,
            json: None,
            error: None,
            raw: None,
        }
    }

    fn with_error(mut self, error: String, raw: &[u8]) -> Self {
        self.error = Some(error);
        if !raw.is_empty() {
            self.raw = Some(raw.to_vec());
        }
        self
    }
}

/// Splits `/pkg.Service/Method` into `(service, method, full)`. A path that
/// does not carry both parts yields empty components; the decoder turns that
/// into an `unknown method` error.
pub fn split_method_path(path: &str) -> (String, String, String) {
    let full = path.to_string();
    let trimmed = path.trim_start_matches('/');
    match trimmed.rsplit_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            (service.to_string(), method.to_string(), full)
        }
        _ => (String::new(), String::new(), full),
    }
}

/// Decodes one envelope frame against the registry.
pub fn decode_frame(
    frame: &EnvelopeFrame,
    service: &str,
    method: &str,
    direction: Direction,
    registry: &MessageRegistry,
) -> GrpcMessage {
    let mut message = GrpcMessage::new(service, method, direction);
    message.compressed = frame.compressed;
    message.size = frame.payload.len();

    if frame.compressed {
        match gunzip(&frame.payload) {
            Ok(decompressed) => {
                message.size = decompressed.len();
                decode_payload(message, &decompressed, service, method, direction, registry)
            }
            Err(_) => message.with_error("gzip decompression failed".to_string(), &frame.payload),
        }
    } else {
        decode_payload(message, &frame.payload, service, method, direction, registry)
    }
}

/// Connect unary: the entire (already content-decoded) body is one message.
pub fn decode_unary_body(
    body: &[u8],
    service: &str,
    method: &str,
    direction: Direction,
    registry: &MessageRegistry,
) -> GrpcMessage {
    let mut message = GrpcMessage::new(service, method, direction);
    message.size = body.len();
    decode_payload(message, body, service, method, direction, registry)
}

/// Connect JSON: the body already is the canonical representation.
pub fn decode_json_body(
    body: &[u8],
    service: &str,
    method: &str,
    direction: Direction,
) -> GrpcMessage {
    let mut message = GrpcMessage::new(service, method, direction);
    message.size = body.len();

    if service.is_empty() {
        return message.with_error("unknown method".to_string(), body);
    }
    if body.is_empty() {
        message.json = Some("{}".to_string());
        return message;
    }
    match std::str::from_utf8(body) {
        Ok(text) if serde_json::from_str::<serde_json::Value>(text).is_ok() => {
            message.json = Some(text.to_string());
            message
        }
        _ => message.with_error("invalid JSON body".to_string(), body),
    }
}

fn decode_payload(
    mut message: GrpcMessage,
    data: &[u8],
    service: &str,
    method: &str,
    direction: Direction,
    registry: &MessageRegistry,
) -> GrpcMessage {
    // Empty payloads are valid empty messages; a literal `{}` shows up for
    // some unary empties and must not reach the protobuf decoder.
    if data.is_empty() || data == b"{}" {
        message.json = Some("{}".to_string());
        return message;
    }

    if service.is_empty() {
        return message.with_error("unknown method".to_string(), data);
    }

    registry.ensure(service, method);
    let descriptor = match direction {
        Direction::ClientToServer => registry.request_type(service, method),
        Direction::ServerToClient => registry.response_type(service, method),
    };
    let Some(descriptor) = descriptor else {
        return message.with_error(
            format!("unknown message type for {service}/{method}"),
            data,
        );
    };

    let decoded = match DynamicMessage::decode(descriptor, data) {
        Ok(decoded) => decoded,
        Err(error) => {
            return message.with_error(format!("unmarshal error: {error}"), data);
        }
    };

    match serde_json::to_string(&decoded) {
        Ok(json) => {
            message.json = Some(json);
            message
        }
        Err(error) => message.with_error(format!("json render error: {error}"), data),
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use rpctap_http::{Direction, EnvelopeFrame};

    use super::{decode_frame, decode_json_body, split_method_path};
    use crate::MessageRegistry;

    fn frame(compressed: bool, payload: &[u8]) -> EnvelopeFrame {
        EnvelopeFrame {
            compressed,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn splits_dotted_service_paths() {
        let (service, method, full) = split_method_path("/pkg.v1.Echo/Unary");
        assert_eq!(service, "pkg.v1.Echo");
        assert_eq!(method, "Unary");
        assert_eq!(full, "/pkg.v1.Echo/Unary");
    }

    #[test]
    fn malformed_paths_yield_empty_components() {
        assert_eq!(split_method_path("").0, "");
        assert_eq!(split_method_path("/").0, "");
        assert_eq!(split_method_path("/noslash").0, "");
        assert_eq!(split_method_path("//Method").0, "");
    }

    #[test]
    fn empty_payload_decodes_to_empty_object() {
        let registry = MessageRegistry::new();
        let message = decode_frame(
            &frame(false, b""),
            "pkg.v1.Echo",
            "Unary",
            Direction::ClientToServer,
            &registry,
        );
        assert_eq!(message.json.as_deref(), Some("{}"));
        assert!(message.error.is_none());
    }

    #[test]
    fn literal_braces_payload_skips_protobuf_decoding() {
        let registry = MessageRegistry::new();
        let message = decode_frame(
            &frame(false, b"{}"),
            "pkg.v1.Echo",
            "Unary",
            Direction::ClientToServer,
            &registry,
        );
        assert_eq!(message.json.as_deref(), Some("{}"));
        assert!(message.error.is_none());
    }

    #[test]
    fn empty_service_reports_unknown_method() {
        let registry = MessageRegistry::new();
        let message = decode_frame(
            &frame(false, b"\x0a\x01x"),
            "",
            "",
            Direction::ClientToServer,
            &registry,
        );
        assert_eq!(message.error.as_deref(), Some("unknown method"));
        assert_eq!(message.raw.as_deref(), Some(&b"\x0a\x01x"[..]));
    }

    #[test]
    fn unknown_type_keeps_raw_payload() {
        let registry = MessageRegistry::new();
        let message = decode_frame(
            &frame(false, b"\x0a\x03abc"),
            "unknown.v1.Svc",
            "M",
            Direction::ServerToClient,
            &registry,
        );
        assert_eq!(
            message.error.as_deref(),
            Some("unknown message type for unknown.v1.Svc/M")
        );
        assert_eq!(message.raw.as_deref(), Some(&b"\x0a\x03abc"[..]));
        assert!(message.json.is_none());
    }

    #[test]
    fn corrupt_compressed_frame_reports_gzip_failure() {
        let registry = MessageRegistry::new();
        let message = decode_frame(
            &frame(true, b"not gzip"),
            "pkg.v1.Echo",
            "Unary",
            Direction::ClientToServer,
            &registry,
        );
        assert_eq!(message.error.as_deref(), Some("gzip decompression failed"));
        assert_eq!(message.raw.as_deref(), Some(&b"not gzip"[..]));
        assert!(message.compressed);
    }

    #[test]
    fn json_body_passes_through_when_valid() {
        let message = decode_json_body(
            b"{\"text\":\"hi\"}",
            "pkg.v1.Echo",
            "Unary",
            Direction::ClientToServer,
        );
        assert_eq!(message.json.as_deref(), Some("{\"text\":\"hi\"}"));
        assert!(message.error.is_none());
    }

    #[test]
    fn invalid_json_body_reports_error_with_raw() {
        let message = decode_json_body(
            b"\xff\xfe",
            "pkg.v1.Echo",
            "Unary",
            Direction::ClientToServer,
        );
        assert_eq!(message.error.as_deref(), Some("invalid JSON body"));
        assert!(message.raw.is_some());
    }
}
