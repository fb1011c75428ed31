use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H1Role {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub role: H1Role,
    pub method: String,
    pub target: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderField>,
    pub body: BodyMode,
}

impl MessageHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Content-Encoding values in header order, lowercased, `identity`
    /// removed.
    pub fn content_encodings(&self) -> Vec<String> {
        let Some(value) = self.header("content-encoding") else {
            return Vec::new();
        };
        value
            .split(',')
            .map(|part| part.trim().to_ascii_lowercase())
            .filter(|part| !part.is_empty() && part != "identity")
            .collect()
    }

    /// Clones the header set into a multi-value map, preserving repeats.
    pub fn header_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for field in &self.headers {
            map.entry(field.name.clone())
                .or_default()
                .push(field.value.clone());
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H1Event {
    Head(MessageHead),
    /// Transfer-decoded body bytes (de-chunked, content-encoding untouched).
    BodyChunk(Vec<u8>),
    MessageEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H1Error {
    HeadTooLarge,
    MalformedHead(String),
    MalformedChunk(String),
}

impl fmt::Display for H1Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadTooLarge => write!(f, "message head exceeded configured limit"),
            Self::MalformedHead(detail) => write!(f, "malformed message head: {detail}"),
            Self::MalformedChunk(detail) => write!(f, "malformed chunked encoding: {detail}"),
        }
    }
}

impl StdError for H1Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    CloseBody,
    Failed,
}

/// Incremental HTTP/1.1 message parser for one direction of a mirrored
/// stream. Bytes go in as they arrive; heads, transfer-decoded body chunks
/// and message boundaries come out. The assembler never owns the socket, so
/// it can lag or fail without touching the forwarding path.
#[derive(Debug)]
pub struct MessageAssembler {
    role: H1Role,
    max_head_bytes: usize,
    buf: Vec<u8>,
    state: State,
}

impl MessageAssembler {
    pub fn new(role: H1Role) -> Self {
        Self::with_max_head_bytes(role, DEFAULT_MAX_HEAD_BYTES)
    }

    pub fn with_max_head_bytes(role: H1Role, max_head_bytes: usize) -> Self {
        Self {
            role,
            max_head_bytes,
            buf: Vec::new(),
            state: State::Head,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<H1Event>, H1Error> {
        if self.state == State::Failed {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            match self.state {
                State::Head => {
                    let Some(head_end) = find_subsequence(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > self.max_head_bytes {
                            self.state = State::Failed;
                            return Err(H1Error::HeadTooLarge);
                        }
                        break;
                    };
                    let head_bytes: Vec<u8> = self.buf.drain(..head_end + 4).collect();
                    let head = match parse_head(self.role, &head_bytes[..head_end]) {
                        Ok(head) => head,
                        Err(error) => {
                            self.state = State::Failed;
                            return Err(error);
                        }
                    };
                    let body = head.body;
                    events.push(H1Event::Head(head));
                    self.state = match body {
                        BodyMode::None | BodyMode::ContentLength(0) => {
                            events.push(H1Event::MessageEnd);
                            State::Head
                        }
                        BodyMode::ContentLength(len) => State::FixedBody { remaining: len },
                        BodyMode::Chunked => State::ChunkSize,
                        BodyMode::CloseDelimited => State::CloseBody,
                    };
                }
                State::FixedBody { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (remaining.min(self.buf.len() as u64)) as usize;
                    let data: Vec<u8> = self.buf.drain(..take).collect();
                    events.push(H1Event::BodyChunk(data));
                    let left = remaining - take as u64;
                    if left == 0 {
                        events.push(H1Event::MessageEnd);
                        self.state = State::Head;
                    } else {
                        self.state = State::FixedBody { remaining: left };
                        break;
                    }
                }
                State::ChunkSize => {
                    let Some(line_end) = find_subsequence(&self.buf, b"\r\n") else {
                        if self.buf.len() > self.max_head_bytes {
                            self.state = State::Failed;
                            return Err(H1Error::MalformedChunk(
                                "chunk size line exceeded limit".to_string(),
                            ));
                        }
                        break;
                    };
                    let line: Vec<u8> = self.buf.drain(..line_end + 2).collect();
                    let size = match parse_chunk_size(&line[..line_end]) {
                        Ok(size) => size,
                        Err(error) => {
                            self.state = State::Failed;
                            return Err(error);
                        }
                    };
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (remaining.min(self.buf.len() as u64)) as usize;
                    let data: Vec<u8> = self.buf.drain(..take).collect();
                    events.push(H1Event::BodyChunk(data));
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData { remaining: left };
                        break;
                    }
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        self.state = State::Failed;
                        return Err(H1Error::MalformedChunk(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    self.buf.drain(..2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line_end) = find_subsequence(&self.buf, b"\r\n") else {
                        break;
                    };
                    let line: Vec<u8> = self.buf.drain(..line_end + 2).collect();
                    if line_end == 0 {
                        events.push(H1Event::MessageEnd);
                        self.state = State::Head;
                    } else {
                        // trailer fields are forwarded but not recorded
                        let _ = line;
                    }
                }
                State::CloseBody => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let data: Vec<u8> = self.buf.drain(..).collect();
                    events.push(H1Event::BodyChunk(data));
                    break;
                }
                State::Failed => break,
            }
        }

        Ok(events)
    }

    /// Signals source EOF. A close-delimited body ends here; anything else
    /// mid-message is simply abandoned, like the forwarded stream was.
    pub fn finish(&mut self) -> Vec<H1Event> {
        if self.state == State::CloseBody {
            self.state = State::Head;
            return vec![H1Event::MessageEnd];
        }
        Vec::new()
    }
}

fn parse_head(role: H1Role, raw: &[u8]) -> Result<MessageHead, H1Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| H1Error::MalformedHead("head was not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| H1Error::MalformedHead("start line is missing".to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| H1Error::MalformedHead(format!("header line without colon: {line}")))?;
        headers.push(HeaderField {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    match role {
        H1Role::Request => {
            let mut parts = start_line.split_whitespace();
            let method = parts
                .next()
                .ok_or_else(|| H1Error::MalformedHead("request method is missing".to_string()))?;
            let target = parts
                .next()
                .ok_or_else(|| H1Error::MalformedHead("request target is missing".to_string()))?;
            let version = parts
                .next()
                .ok_or_else(|| H1Error::MalformedHead("HTTP version is missing".to_string()))?;
            if !version.starts_with("HTTP/1.") {
                return Err(H1Error::MalformedHead(format!(
                    "unsupported HTTP version {version}"
                )));
            }

            let body = request_body_mode(&headers)?;
            Ok(MessageHead {
                role,
                method: method.to_string(),
                target: target.to_string(),
                status: 0,
                reason: String::new(),
                headers,
                body,
            })
        }
        H1Role::Response => {
            let mut parts = start_line.split_whitespace();
            let version = parts
                .next()
                .ok_or_else(|| H1Error::MalformedHead("response version is missing".to_string()))?;
            if !version.starts_with("HTTP/1.") {
                return Err(H1Error::MalformedHead(format!(
                    "unsupported HTTP version {version}"
                )));
            }
            let status = parts
                .next()
                .and_then(|text| text.parse::<u16>().ok())
                .ok_or_else(|| H1Error::MalformedHead("invalid response status".to_string()))?;
            let reason = parts.collect::<Vec<_>>().join(" ");

            let body = response_body_mode(status, &headers)?;
            Ok(MessageHead {
                role,
                method: String::new(),
                target: String::new(),
                status,
                reason,
                headers,
                body,
            })
        }
    }
}

fn request_body_mode(headers: &[HeaderField]) -> Result<BodyMode, H1Error> {
    if is_chunked(headers) {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyMode::None),
        Some(len) => Ok(BodyMode::ContentLength(len)),
    }
}

fn response_body_mode(status: u16, headers: &[HeaderField]) -> Result<BodyMode, H1Error> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyMode::None);
    }
    if is_chunked(headers) {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyMode::None),
        Some(len) => Ok(BodyMode::ContentLength(len)),
        None => Ok(BodyMode::CloseDelimited),
    }
}

fn is_chunked(headers: &[HeaderField]) -> bool {
    headers
        .iter()
        .filter(|field| field.name.eq_ignore_ascii_case("transfer-encoding"))
        .any(|field| {
            field
                .value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn content_length(headers: &[HeaderField]) -> Result<Option<u64>, H1Error> {
    let Some(field) = headers
        .iter()
        .find(|field| field.name.eq_ignore_ascii_case("content-length"))
    else {
        return Ok(None);
    };
    field
        .value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| H1Error::MalformedHead(format!("invalid content-length {}", field.value)))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, H1Error> {
    let text = std::str::from_utf8(line)
        .map_err(|_| H1Error::MalformedChunk("chunk size was not UTF-8".to_string()))?;
    let size_text = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| H1Error::MalformedChunk(format!("invalid chunk size {size_text}")))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::{BodyMode, H1Error, H1Event, H1Role, MessageAssembler};

    fn collect_heads(events: &[H1Event]) -> Vec<&super::MessageHead> {
        events
            .iter()
            .filter_map(|event| match event {
                H1Event::Head(head) => Some(head),
                _ => None,
            })
            .collect()
    }

    fn collect_body(events: &[H1Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                H1Event::BodyChunk(data) => Some(data.as_slice()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    #[test]
    fn parses_request_without_body() {
        let mut assembler = MessageAssembler::new(H1Role::Request);
        let events = assembler
            .push(b"GET /ping HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .expect("push");
        let heads = collect_heads(&events);
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].method, "GET");
        assert_eq!(heads[0].target, "/ping");
        assert_eq!(heads[0].header("host"), Some("example.test"));
        assert_eq!(heads[0].body, BodyMode::None);
        assert!(matches!(events.last(), Some(H1Event::MessageEnd)));
    }

    #[test]
    fn parses_content_length_body_split_across_pushes() {
        let mut assembler = MessageAssembler::new(H1Role::Request);
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        let first = assembler.push(raw).expect("push");
        assert_eq!(collect_body(&first), b"hel");

        let second = assembler.push(b"lo").expect("push");
        assert_eq!(collect_body(&second), b"lo");
        assert!(matches!(second.last(), Some(H1Event::MessageEnd)));
    }

    #[test]
    fn parses_chunked_response_across_arbitrary_splits() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        for split in 1..raw.len() {
            let mut assembler = MessageAssembler::new(H1Role::Response);
            let mut events = assembler.push(&raw[..split]).expect("first push");
            events.extend(assembler.push(&raw[split..]).expect("second push"));
            assert_eq!(collect_body(&events), b"Wikipedia");
            assert!(matches!(events.last(), Some(H1Event::MessageEnd)));
        }
    }

    #[test]
    fn close_delimited_response_ends_on_finish() {
        let mut assembler = MessageAssembler::new(H1Role::Response);
        let events = assembler
            .push(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\npong")
            .expect("push");
        assert_eq!(collect_body(&events), b"pong");
        assert!(!events.iter().any(|e| matches!(e, H1Event::MessageEnd)));

        let tail = assembler.finish();
        assert_eq!(tail, vec![H1Event::MessageEnd]);
    }

    #[test]
    fn response_204_has_no_body() {
        let mut assembler = MessageAssembler::new(H1Role::Response);
        let events = assembler
            .push(b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .expect("push");
        let heads = collect_heads(&events);
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].status, 204);
        assert_eq!(heads[1].status, 200);
        assert_eq!(collect_body(&events), b"ok");
    }

    #[test]
    fn pipelined_requests_yield_two_messages() {
        let mut assembler = MessageAssembler::new(H1Role::Request);
        let events = assembler
            .push(
                b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi\
                  POST /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
            )
            .expect("push");
        let heads = collect_heads(&events);
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].target, "/a");
        assert_eq!(heads[1].target, "/b");
        let ends = events
            .iter()
            .filter(|e| matches!(e, H1Event::MessageEnd))
            .count();
        assert_eq!(ends, 2);
    }

    #[test]
    fn oversized_head_fails() {
        let mut assembler = MessageAssembler::with_max_head_bytes(H1Role::Request, 64);
        let mut raw = b"GET /".to_vec();
        raw.extend_from_slice(&[b'x'; 128]);
        let error = assembler.push(&raw).expect_err("must fail");
        assert_eq!(error, H1Error::HeadTooLarge);
        // A failed assembler goes quiet instead of erroring repeatedly.
        assert!(assembler.push(b" HTTP/1.1\r\n\r\n").expect("push").is_empty());
    }

    #[test]
    fn bad_chunk_size_fails() {
        let mut assembler = MessageAssembler::new(H1Role::Response);
        let error = assembler
            .push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .expect_err("must fail");
        assert!(matches!(error, H1Error::MalformedChunk(_)));
    }

    #[test]
    fn header_map_preserves_repeated_headers() {
        let mut assembler = MessageAssembler::new(H1Role::Response);
        let events = assembler
            .push(b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n")
            .expect("push");
        let heads = collect_heads(&events);
        let map = heads[0].header_map();
        assert_eq!(map["Set-Cookie"], vec!["a=1", "b=2"]);
    }

    #[test]
    fn content_encodings_drop_identity_and_keep_order() {
        let mut assembler = MessageAssembler::new(H1Role::Response);
        let events = assembler
            .push(b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip, identity, br\r\nContent-Length: 0\r\n\r\n")
            .expect("push");
        let heads = collect_heads(&events);
        assert_eq!(heads[0].content_encodings(), vec!["gzip", "br"]);
    }
}
