use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rpctap_http::Direction;
use rpctap_proto::GrpcMessage;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{HeaderMap, Record, RecordKind, TrafficLog};

const SESSION_ID_LEN: usize = 12;
const SSE_DATA_LIMIT: usize = 1000;

pub type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;

/// Appends one JSON line per record, keeps a bounded tail in memory for
/// subscriber priming, and hands every record to an optional broadcast
/// callback. One mutex is held across the whole emission — file write, ring
/// push and callback — so lines never interleave, `(session, index)` pairs
/// never repeat, and the ring and the broadcast stream always agree on
/// ordering.
pub struct Recorder {
    state: Mutex<RecorderState>,
    ring_capacity: usize,
    session_seq: AtomicU64,
    records_written: AtomicU64,
}

struct RecorderState {
    writer: Option<BufWriter<File>>,
    ring: VecDeque<Record>,
    on_record: Option<RecordCallback>,
}

impl Recorder {
    /// `path = None` keeps only the in-memory tail. The file is opened in
    /// append mode so restarts extend the existing log.
    pub fn open(path: Option<&Path>, ring_capacity: usize) -> std::io::Result<Arc<Self>> {
        let writer = match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        Ok(Arc::new(Self {
            state: Mutex::new(RecorderState {
                writer,
                ring: VecDeque::with_capacity(ring_capacity.min(4096)),
                on_record: None,
            }),
            ring_capacity: ring_capacity.max(1),
            session_seq: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
        }))
    }

    pub fn set_on_record(&self, callback: RecordCallback) {
        self.state.lock().expect("recorder lock poisoned").on_record = Some(callback);
    }

    pub fn new_session(self: &Arc<Self>, host: &str) -> Arc<Session> {
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Session {
            id: session_id(),
            seq,
            host: host.to_string(),
            recorder: Arc::clone(self),
            record_index: AtomicU64::new(0),
        })
    }

    pub fn record_count(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> u64 {
        self.session_seq.load(Ordering::Relaxed)
    }

    /// The most recent `limit` records in original emission order.
    pub fn recent_records(&self, limit: usize) -> Vec<Record> {
        let state = self.state.lock().expect("recorder lock poisoned");
        let take = limit.min(state.ring.len());
        state
            .ring
            .iter()
            .skip(state.ring.len() - take)
            .cloned()
            .collect()
    }

    fn write(&self, record: Record) {
        let mut state = self.state.lock().expect("recorder lock poisoned");

        if let Some(writer) = state.writer.as_mut() {
            match serde_json::to_vec(&record) {
                Ok(mut line) => {
                    line.push(b'\n');
                    if let Err(error) = writer.write_all(&line).and_then(|()| writer.flush()) {
                        tracing::warn!(%error, "record log write failed");
                    }
                }
                Err(error) => tracing::warn!(%error, "record serialization failed"),
            }
        }
        self.records_written.fetch_add(1, Ordering::Relaxed);

        if state.ring.len() == self.ring_capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(record.clone());

        // Still inside the emission lock: subscribers observe the same order
        // the ring and the log recorded. The hub only does a try_send here.
        if let Some(callback) = state.on_record.as_ref() {
            callback(&record);
        }
    }
}

/// One intercepted connection's identity: opaque id for correlation, global
/// sequence for cross-session ordering, and a private record index.
pub struct Session {
    id: String,
    seq: u64,
    host: String,
    recorder: Arc<Recorder>,
    record_index: AtomicU64,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn record(&self, kind: RecordKind) -> Record {
        let mut record = Record::blank(kind);
        record.ts = timestamp();
        record.session = self.id.clone();
        record.seq = self.seq;
        record.index = self.record_index.fetch_add(1, Ordering::Relaxed) + 1;
        record
    }
}

impl TrafficLog for Session {
    fn log_request(&self, method: &str, url: &str, headers: &HeaderMap, content_type: &str) {
        let mut record = self.record(RecordKind::Request);
        record.method = Some(method.to_string());
        record.url = Some(url.to_string());
        record.host = Some(self.host.clone());
        record.headers = Some(headers.clone());
        record.content_type = non_empty(content_type);
        self.recorder.write(record);
    }

    fn log_response(&self, status: u16, status_text: &str, headers: &HeaderMap, content_type: &str) {
        let mut record = self.record(RecordKind::Response);
        record.status = Some(status);
        record.status_text = non_empty(status_text);
        record.host = Some(self.host.clone());
        record.headers = Some(headers.clone());
        record.content_type = non_empty(content_type);
        self.recorder.write(record);
    }

    fn log_sse(&self, event_type: Option<&str>, event_id: Option<&str>, data: &str) {
        let mut record = self.record(RecordKind::Sse);
        record.host = Some(self.host.clone());
        record.event_type = Some(
            event_type
                .filter(|name| !name.is_empty())
                .unwrap_or("message")
                .to_string(),
        );
        record.event_id = event_id.map(str::to_string);
        record.event_data = Some(truncate(data, SSE_DATA_LIMIT));
        self.recorder.write(record);
    }

    fn log_body(&self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut record = self.record(RecordKind::Body);
        record.direction = Some(direction.as_str().to_string());
        record.host = Some(self.host.clone());
        record.size = Some(data.len());
        match printable_text(data) {
            Some(text) => {
                record.body = Some(text.to_string());
                record.body_encoding = Some("text".to_string());
            }
            None => {
                record.body_base64 = Some(BASE64.encode(data));
                record.body_encoding = Some("base64".to_string());
            }
        }
        self.recorder.write(record);
    }

    fn log_grpc(&self, message: &GrpcMessage) {
        let mut record = self.record(RecordKind::Grpc);
        record.direction = Some(message.direction.as_str().to_string());
        record.host = Some(self.host.clone());
        record.grpc_service = Some(message.service.clone());
        record.grpc_method = Some(message.method.clone());
        record.url = Some(message.full_method.clone());
        record.grpc_streaming = Some(message.streaming);
        record.grpc_frame_index = Some(message.frame_index);
        record.grpc_compressed = Some(message.compressed);

        match (&message.json, &message.error) {
            (Some(json), _) => {
                record.grpc_data = Some(json.clone());
            }
            (None, Some(error)) => {
                record.error = Some(error.clone());
                record.size = Some(message.size);
                if let Some(raw) = &message.raw {
                    record.grpc_raw = Some(BASE64.encode(raw));
                }
            }
            (None, None) => {
                record.size = Some(message.size);
            }
        }
        self.recorder.write(record);
    }

    fn log_error(&self, error: &str) {
        let mut record = self.record(RecordKind::Error);
        record.host = Some(self.host.clone());
        record.error = Some(error.to_string());
        self.recorder.write(record);
    }

    fn debug(&self, message: &str) {
        let mut record = self.record(RecordKind::Debug);
        record.host = Some(self.host.clone());
        record.error = Some(message.to_string());
        self.recorder.write(record);
    }
}

fn session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Body bytes are stored as text only when they are valid UTF-8 and carry no
/// control characters beyond `\t\r\n`.
fn printable_text(data: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(data).ok()?;
    let printable = data
        .iter()
        .all(|byte| (*byte >= 32 && *byte != 127) || matches!(byte, b'\t' | b'\r' | b'\n'));
    printable.then_some(text)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use rpctap_http::Direction;

    use super::Recorder;
    use crate::{Record, RecordKind, TrafficLog};

    fn headers() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([("Host".to_string(), vec!["example.test".to_string()])])
    }

    #[test]
    fn indices_are_strictly_increasing_per_session() {
        let recorder = Recorder::open(None, 100).expect("recorder");
        let session = recorder.new_session("example.test");

        session.log_request("GET", "/a", &headers(), "");
        session.log_error("x");
        session.log_body(Direction::ServerToClient, b"pong");

        let records = recorder.recent_records(10);
        assert_eq!(records.len(), 3);
        for (offset, record) in records.iter().enumerate() {
            assert_eq!(record.index, offset as u64 + 1);
            assert_eq!(record.session, session.id());
        }
    }

    #[test]
    fn session_sequences_are_unique_and_increasing() {
        let recorder = Recorder::open(None, 100).expect("recorder");
        let first = recorder.new_session("a.test");
        let second = recorder.new_session("b.test");
        assert!(second.seq() > first.seq());
        assert_eq!(recorder.session_count(), 2);
    }

    #[test]
    fn ring_evicts_oldest_and_preserves_order() {
        let recorder = Recorder::open(None, 3).expect("recorder");
        let session = recorder.new_session("ring.test");
        for index in 0..5 {
            session.log_error(&format!("e{index}"));
        }

        let records = recorder.recent_records(10);
        assert_eq!(records.len(), 3);
        let errors: Vec<&str> = records
            .iter()
            .map(|record| record.error.as_deref().unwrap_or(""))
            .collect();
        assert_eq!(errors, vec!["e2", "e3", "e4"]);

        // A smaller fetch returns the newest tail, still in original order.
        let tail = recorder.recent_records(2);
        assert_eq!(tail[0].error.as_deref(), Some("e3"));
        assert_eq!(tail[1].error.as_deref(), Some("e4"));
    }

    #[test]
    fn body_encoding_matches_content() {
        let recorder = Recorder::open(None, 10).expect("recorder");
        let session = recorder.new_session("body.test");

        session.log_body(Direction::ServerToClient, b"plain text\n");
        session.log_body(Direction::ClientToServer, &[0x00, 0x01, 0xff]);

        let records = recorder.recent_records(10);
        assert_eq!(records[0].body_encoding.as_deref(), Some("text"));
        assert_eq!(records[0].body.as_deref(), Some("plain text\n"));
        assert!(records[0].body_base64.is_none());

        assert_eq!(records[1].body_encoding.as_deref(), Some("base64"));
        assert!(records[1].body.is_none());
        assert_eq!(records[1].body_base64.as_deref(), Some("AAH/"));
    }

    #[test]
    fn jsonl_log_contains_one_record_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        let recorder = Recorder::open(Some(&path), 10).expect("recorder");
        let session = recorder.new_session("file.test");

        session.log_request("POST", "/rpc", &headers(), "application/grpc");
        session.log_error("boom");

        let contents = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Record = serde_json::from_str(lines[0]).expect("parse line");
        assert_eq!(first.kind, RecordKind::Request);
        assert_eq!(first.method.as_deref(), Some("POST"));
        assert_eq!(first.content_type.as_deref(), Some("application/grpc"));
    }

    #[test]
    fn broadcast_callback_sees_every_record() {
        let recorder = Recorder::open(None, 10).expect("recorder");
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        recorder.set_on_record(Arc::new(move |_record| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let session = recorder.new_session("cb.test");
        session.log_error("a");
        session.log_error("b");
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert_eq!(recorder.record_count(), 2);
    }

    #[test]
    fn ring_and_broadcast_agree_on_order_under_concurrent_emission() {
        let recorder = Recorder::open(None, 1000).expect("recorder");
        let broadcast_order = Arc::new(Mutex::new(Vec::<(String, u64)>::new()));
        let sink = Arc::clone(&broadcast_order);
        recorder.set_on_record(Arc::new(move |record| {
            sink.lock()
                .expect("test lock")
                .push((record.session.clone(), record.index));
        }));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let session = recorder.new_session("race.test");
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    session.log_error("tick");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let ring_order: Vec<(String, u64)> = recorder
            .recent_records(1000)
            .into_iter()
            .map(|record| (record.session, record.index))
            .collect();
        let broadcast_order = broadcast_order.lock().expect("test lock").clone();
        assert_eq!(ring_order.len(), 200);
        assert_eq!(ring_order, broadcast_order);
    }

    #[test]
    fn sse_data_is_truncated_with_marker() {
        let recorder = Recorder::open(None, 10).expect("recorder");
        let session = recorder.new_session("sse.test");
        let long = "x".repeat(2000);
        session.log_sse(None, None, &long);

        let records = recorder.recent_records(1);
        let data = records[0].event_data.as_deref().expect("event data");
        assert_eq!(data.len(), 1003);
        assert!(data.ends_with("..."));
        assert_eq!(records[0].event_type.as_deref(), Some("message"));
    }
}
