use std::sync::{Arc, Mutex};

use rpctap_http::{
    classify_grpc_content_type, is_event_stream_content_type, ContentDecoder, Direction,
    EnvelopeError, EnvelopeFrame, EnvelopeParser, GrpcContentType, H1Event, H1Role,
    MessageAssembler, MessageHead, SseParser,
};
use rpctap_observe::TrafficLog;
use rpctap_proto::{
    decode_frame, decode_json_body, decode_unary_body, split_method_path, GrpcMessage,
    MessageRegistry,
};
use tokio::sync::mpsc;

use crate::mirror::MirrorChunk;

/// What the request parser leaves behind for response correlation. ALPN pins
/// HTTP/1.1, so a single cell per session is the whole queue.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub path: String,
    pub is_grpc: bool,
}

pub(crate) type PendingSlot = Arc<Mutex<Option<PendingRequest>>>;

pub(crate) struct InspectorContext {
    pub direction: Direction,
    pub log: Arc<dyn TrafficLog>,
    pub registry: Arc<MessageRegistry>,
    pub slot: PendingSlot,
    pub max_head_bytes: usize,
}

/// Consumes one direction's mirrored bytes. Any failure here only stops
/// observation; the forwarding path never waits for this task.
pub(crate) async fn run_inspector(mut rx: mpsc::Receiver<MirrorChunk>, ctx: InspectorContext) {
    let mut machine = DirectionMachine::new(&ctx);
    let mut dead = false;

    while let Some(chunk) = rx.recv().await {
        if dead {
            continue;
        }
        if chunk.preceded_by_gap > 0 {
            ctx.log.debug(&format!(
                "mirror buffer overflow on {}: {} bytes dropped, parsing stopped",
                ctx.direction.as_str(),
                chunk.preceded_by_gap
            ));
            dead = true;
            continue;
        }
        if !machine.push(&chunk.data) {
            dead = true;
        }
    }

    if !dead {
        machine.finish();
    }
}

struct DirectionMachine<'a> {
    ctx: &'a InspectorContext,
    assembler: MessageAssembler,
    body: Option<ActiveBody>,
}

impl<'a> DirectionMachine<'a> {
    fn new(ctx: &'a InspectorContext) -> Self {
        let role = match ctx.direction {
            Direction::ClientToServer => H1Role::Request,
            Direction::ServerToClient => H1Role::Response,
        };
        Self {
            ctx,
            assembler: MessageAssembler::with_max_head_bytes(role, ctx.max_head_bytes),
            body: None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> bool {
        match self.assembler.push(chunk) {
            Ok(events) => {
                self.handle_events(events);
                true
            }
            Err(error) => {
                self.ctx.log.debug(&format!(
                    "http parse error on {}: {error}",
                    self.ctx.direction.as_str()
                ));
                false
            }
        }
    }

    fn finish(&mut self) {
        let events = self.assembler.finish();
        self.handle_events(events);
        // A body cut off mid-stream still flushes what it has.
        if let Some(body) = self.body.take() {
            body.finish(&*self.ctx.log);
        }
    }

    fn handle_events(&mut self, events: Vec<H1Event>) {
        for event in events {
            match event {
                H1Event::Head(head) => self.start_message(head),
                H1Event::BodyChunk(data) => {
                    if let Some(body) = self.body.as_mut() {
                        body.push(&data, &*self.ctx.log);
                    }
                }
                H1Event::MessageEnd => {
                    if let Some(body) = self.body.take() {
                        body.finish(&*self.ctx.log);
                    }
                }
            }
        }
    }

    fn start_message(&mut self, head: MessageHead) {
        let sink = match self.ctx.direction {
            Direction::ClientToServer => self.start_request(&head),
            Direction::ServerToClient => self.start_response(&head),
        };
        self.body = Some(ActiveBody {
            decoder: ContentDecoder::new(&head.content_encodings()),
            sink,
            decode_failed: false,
        });
    }

    fn start_request(&mut self, head: &MessageHead) -> BodySink {
        self.ctx.log.log_request(
            &head.method,
            &head.target,
            &head.header_map(),
            head.content_type(),
        );

        let content = classify_grpc_content_type(head.content_type());
        let is_grpc = head.method == "POST" && content.is_grpc_like();
        *self.ctx.slot.lock().expect("pending slot poisoned") = Some(PendingRequest {
            path: head.target.clone(),
            is_grpc,
        });

        if is_grpc {
            self.grpc_sink(&head.target, content, false)
        } else {
            BodySink::bulk(self.ctx.direction)
        }
    }

    fn start_response(&mut self, head: &MessageHead) -> BodySink {
        self.ctx.log.log_response(
            head.status,
            &head.reason,
            &head.header_map(),
            head.content_type(),
        );

        let pending = self
            .ctx
            .slot
            .lock()
            .expect("pending slot poisoned")
            .take();
        if pending.is_none() {
            self.ctx.log.log_error("response without request");
        }
        let (path, request_was_grpc) = match &pending {
            Some(pending) => (pending.path.as_str(), pending.is_grpc),
            None => ("", false),
        };

        let content = classify_grpc_content_type(head.content_type());
        let sse = is_event_stream_content_type(head.content_type());

        if content.is_grpc_like() {
            self.grpc_sink(path, content, false)
        } else if request_was_grpc && sse {
            // Framed gRPC tunnelled through an SSE-shaped response.
            self.grpc_sink_framed(path, true)
        } else if sse {
            BodySink::Sse {
                parser: SseParser::new(),
            }
        } else {
            BodySink::bulk(self.ctx.direction)
        }
    }

    fn grpc_sink(&self, path: &str, content: GrpcContentType, force_streaming: bool) -> BodySink {
        if content.has_envelope_framing() {
            return self.grpc_sink_framed(path, force_streaming || content.connect_stream_proto);
        }
        let (service, method, _) = split_method_path(path);
        if content.connect_json {
            BodySink::GrpcJson {
                service,
                method,
                direction: self.ctx.direction,
                data: Vec::new(),
            }
        } else {
            BodySink::GrpcUnary {
                service,
                method,
                direction: self.ctx.direction,
                registry: Arc::clone(&self.ctx.registry),
                data: Vec::new(),
            }
        }
    }

    fn grpc_sink_framed(&self, path: &str, streaming: bool) -> BodySink {
        let (service, method, _) = split_method_path(path);
        BodySink::GrpcFramed {
            service,
            method,
            direction: self.ctx.direction,
            registry: Arc::clone(&self.ctx.registry),
            parser: EnvelopeParser::new(),
            streaming,
            next_frame_index: 0,
            dead: false,
        }
    }
}

struct ActiveBody {
    decoder: ContentDecoder,
    sink: BodySink,
    decode_failed: bool,
}

impl ActiveBody {
    fn push(&mut self, data: &[u8], log: &dyn TrafficLog) {
        if self.decode_failed {
            return;
        }
        match self.decoder.push(data) {
            Ok(decoded) => self.sink.push(&decoded, log),
            Err(error) => {
                log.debug(&format!("content decode error: {error}"));
                self.decode_failed = true;
            }
        }
    }

    fn finish(mut self, log: &dyn TrafficLog) {
        if !self.decode_failed {
            match self.decoder.finish() {
                Ok(tail) => {
                    if !tail.is_empty() {
                        self.sink.push(&tail, log);
                    }
                }
                Err(error) => log.debug(&format!("content decode error: {error}")),
            }
        }
        self.sink.finish(log);
    }
}

enum BodySink {
    Bulk {
        direction: Direction,
        data: Vec<u8>,
    },
    GrpcFramed {
        service: String,
        method: String,
        direction: Direction,
        registry: Arc<MessageRegistry>,
        parser: EnvelopeParser,
        streaming: bool,
        next_frame_index: u32,
        dead: bool,
    },
    GrpcUnary {
        service: String,
        method: String,
        direction: Direction,
        registry: Arc<MessageRegistry>,
        data: Vec<u8>,
    },
    GrpcJson {
        service: String,
        method: String,
        direction: Direction,
        data: Vec<u8>,
    },
    Sse {
        parser: SseParser,
    },
}

impl BodySink {
    fn bulk(direction: Direction) -> Self {
        Self::Bulk {
            direction,
            data: Vec::new(),
        }
    }

    fn push(&mut self, decoded: &[u8], log: &dyn TrafficLog) {
        match self {
            Self::Bulk { data, .. }
            | Self::GrpcUnary { data, .. }
            | Self::GrpcJson { data, .. } => {
                data.extend_from_slice(decoded);
            }
            Self::GrpcFramed {
                service,
                method,
                direction,
                registry,
                parser,
                streaming,
                next_frame_index,
                dead,
            } => {
                if *dead {
                    return;
                }
                match parser.push(decoded) {
                    Ok(frames) => {
                        for frame in frames {
                            let mut message =
                                decode_frame(&frame, service, method, *direction, registry);
                            message.streaming = *streaming;
                            message.frame_index = *next_frame_index;
                            *next_frame_index += 1;
                            log.log_grpc(&message);
                        }
                    }
                    Err(error) => {
                        log.log_grpc(&envelope_error_message(
                            service,
                            method,
                            *direction,
                            *streaming,
                            *next_frame_index,
                            &error,
                        ));
                        *dead = true;
                    }
                }
            }
            Self::Sse { parser } => {
                for event in parser.push(decoded) {
                    log.log_sse(event.event.as_deref(), event.id.as_deref(), &event.data);
                }
            }
        }
    }

    fn finish(self, log: &dyn TrafficLog) {
        match self {
            Self::Bulk { direction, data } => {
                if !data.is_empty() {
                    log.log_body(direction, &data);
                }
            }
            Self::GrpcFramed {
                service,
                method,
                direction,
                registry,
                mut parser,
                streaming,
                next_frame_index,
                dead,
            } => {
                if dead {
                    return;
                }
                match parser.finish() {
                    Ok(()) => {
                        if parser.frames_emitted() == 0 {
                            // An empty framed body is a valid empty message.
                            let empty = EnvelopeFrame {
                                compressed: false,
                                payload: Vec::new(),
                            };
                            let mut message =
                                decode_frame(&empty, &service, &method, direction, &registry);
                            message.streaming = streaming;
                            message.frame_index = 0;
                            log.log_grpc(&message);
                        }
                    }
                    Err(error) => {
                        log.log_grpc(&envelope_error_message(
                            &service,
                            &method,
                            direction,
                            streaming,
                            next_frame_index,
                            &error,
                        ));
                    }
                }
            }
            Self::GrpcUnary {
                service,
                method,
                direction,
                registry,
                data,
            } => {
                log.log_grpc(&decode_unary_body(
                    &data, &service, &method, direction, &registry,
                ));
            }
            Self::GrpcJson {
                service,
                method,
                direction,
                data,
            } => {
                log.log_grpc(&decode_json_body(&data, &service, &method, direction));
            }
            Self::Sse { mut parser } => {
                if let Some(event) = parser.finish() {
                    log.log_sse(event.event.as_deref(), event.id.as_deref(), &event.data);
                }
            }
        }
    }
}

fn envelope_error_message(
    service: &str,
    method: &str,
    direction: Direction,
    streaming: bool,
    frame_index: u32,
    error: &EnvelopeError,
) -> GrpcMessage {
    let mut message = GrpcMessage::new(service, method, direction);
    message.streaming = streaming;
    message.frame_index = frame_index;
    message.error = Some(match error {
        EnvelopeError::FrameTooLarge { .. } => error.to_string(),
        EnvelopeError::TruncatedFrame { .. } => format!("frame read error: {error}"),
    });
    message
}
