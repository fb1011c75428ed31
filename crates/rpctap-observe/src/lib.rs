use std::collections::BTreeMap;

use rpctap_http::Direction;
use rpctap_proto::GrpcMessage;
use serde::{Deserialize, Serialize};

mod hub;
mod recorder;

pub use hub::{Subscriber, SubscriptionHub, SubscriptionHubHandle, SUBSCRIBER_QUEUE_CAPACITY};
pub use recorder::{RecordCallback, Recorder, Session};

pub type HeaderMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Request,
    Response,
    Sse,
    Body,
    Grpc,
    Error,
    Debug,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Sse => "sse",
            Self::Body => "body",
            Self::Grpc => "grpc",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// One line of the append-only log, and one message on the subscription
/// channel. `(session, index)` is unique for a recorder lifetime; `seq`
/// orders sessions process-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub ts: String,
    pub session: String,
    pub seq: u64,
    pub index: u64,
    #[serde(rename = "type")]
    pub kind: RecordKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_frame_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_compressed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_raw: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Record {
    pub(crate) fn blank(kind: RecordKind) -> Self {
        Self {
            ts: String::new(),
            session: String::new(),
            seq: 0,
            index: 0,
            kind,
            method: None,
            url: None,
            host: None,
            status: None,
            status_text: None,
            event_type: None,
            event_id: None,
            event_data: None,
            headers: None,
            content_type: None,
            direction: None,
            size: None,
            body: None,
            body_base64: None,
            body_encoding: None,
            grpc_service: None,
            grpc_method: None,
            grpc_data: None,
            grpc_streaming: None,
            grpc_frame_index: None,
            grpc_compressed: None,
            grpc_raw: None,
            error: None,
        }
    }
}

/// Capability set the stream parsers emit into. The recorder's `Session`
/// implements it; tests use `NopTrafficLog` or their own collectors.
pub trait TrafficLog: Send + Sync {
    fn log_request(&self, method: &str, url: &str, headers: &HeaderMap, content_type: &str);
    fn log_response(&self, status: u16, status_text: &str, headers: &HeaderMap, content_type: &str);
    fn log_sse(&self, event_type: Option<&str>, event_id: Option<&str>, data: &str);
    fn log_body(&self, direction: Direction, data: &[u8]);
    fn log_grpc(&self, message: &GrpcMessage);
    fn log_error(&self, error: &str);
    fn debug(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NopTrafficLog;

impl TrafficLog for NopTrafficLog {
    fn log_request(&self, _method: &str, _url: &str, _headers: &HeaderMap, _content_type: &str) {}
    fn log_response(
        &self,
        _status: u16,
        _status_text: &str,
        _headers: &HeaderMap,
        _content_type: &str,
    ) {
    }
    fn log_sse(&self, _event_type: Option<&str>, _event_id: Option<&str>, _data: &str) {}
    fn log_body(&self, _direction: Direction, _data: &[u8]) {}
    fn log_grpc(&self, _message: &GrpcMessage) {}
    fn log_error(&self, _error: &str) {}
    fn debug(&self, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::{Record, RecordKind};

    #[test]
    fn unset_fields_stay_off_the_wire() {
        let mut record = Record::blank(RecordKind::Error);
        record.ts = "2026-01-01T00:00:00Z".to_string();
        record.session = "abc".to_string();
        record.seq = 1;
        record.index = 2;
        record.host = Some("example.test".to_string());
        record.error = Some("boom".to_string());

        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(
            json,
            "{\"ts\":\"2026-01-01T00:00:00Z\",\"session\":\"abc\",\"seq\":1,\"index\":2,\
             \"type\":\"error\",\"host\":\"example.test\",\"error\":\"boom\"}"
        );
    }

    #[test]
    fn records_round_trip_through_json() {
        let mut record = Record::blank(RecordKind::Grpc);
        record.ts = "2026-01-01T00:00:00Z".to_string();
        record.session = "abc".to_string();
        record.grpc_streaming = Some(true);
        record.grpc_frame_index = Some(0);

        let json = serde_json::to_string(&record).expect("serialize");
        let back: Record = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
