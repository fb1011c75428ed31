use std::error::Error as StdError;
use std::fmt;

/// Declared payloads above this are treated as corrupt rather than buffered.
pub const MAX_ENVELOPE_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// One decoded `[flag:1][len:4]` envelope. The payload is the raw wire bytes;
/// decompression of flagged frames happens in the message decoder, which can
/// attach the raw bytes to an error record when it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeFrame {
    pub compressed: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    FrameTooLarge { declared: usize },
    TruncatedFrame { expected: usize, missing: usize },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { declared } => {
                write!(f, "frame too large: {declared} bytes")
            }
            Self::TruncatedFrame { expected, missing } => {
                write!(
                    f,
                    "truncated frame: {missing} of {expected} payload bytes missing"
                )
            }
        }
    }
}

impl StdError for EnvelopeError {}

#[derive(Debug)]
enum State {
    Header { bytes: [u8; 5], filled: usize },
    Payload { compressed: bool, expected: usize, data: Vec<u8> },
    Failed,
}

/// Incremental envelope parser shared by standard gRPC and Connect streaming
/// bodies. Bytes go in as the mirrored stream delivers them; whole frames
/// come out. A `FrameTooLarge` is terminal because alignment is lost.
#[derive(Debug)]
pub struct EnvelopeParser {
    max_payload_len: usize,
    state: State,
    frames_emitted: u64,
}

impl Default for EnvelopeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeParser {
    pub fn new() -> Self {
        Self::with_max_payload_len(MAX_ENVELOPE_PAYLOAD_LEN)
    }

    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self {
            max_payload_len,
            state: State::Header {
                bytes: [0_u8; 5],
                filled: 0,
            },
            frames_emitted: 0,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<EnvelopeFrame>, EnvelopeError> {
        if matches!(self.state, State::Failed) {
            return Ok(Vec::new());
        }

        let mut offset = 0_usize;
        let mut frames = Vec::new();

        while offset < chunk.len() {
            match &mut self.state {
                State::Header { bytes, filled } => {
                    let need = 5 - *filled;
                    let take = need.min(chunk.len() - offset);
                    bytes[*filled..*filled + take]
                        .copy_from_slice(&chunk[offset..offset + take]);
                    *filled += take;
                    offset += take;
                    if *filled < 5 {
                        break;
                    }

                    let compressed = bytes[0] & 0x01 == 0x01;
                    let expected =
                        u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
                    if expected > self.max_payload_len {
                        self.state = State::Failed;
                        return Err(EnvelopeError::FrameTooLarge { declared: expected });
                    }
                    if expected == 0 {
                        frames.push(EnvelopeFrame {
                            compressed,
                            payload: Vec::new(),
                        });
                        self.frames_emitted += 1;
                        self.state = State::Header {
                            bytes: [0_u8; 5],
                            filled: 0,
                        };
                    } else {
                        self.state = State::Payload {
                            compressed,
                            expected,
                            data: Vec::with_capacity(expected.min(64 * 1024)),
                        };
                    }
                }
                State::Payload {
                    compressed,
                    expected,
                    data,
                } => {
                    let need = *expected - data.len();
                    let take = need.min(chunk.len() - offset);
                    data.extend_from_slice(&chunk[offset..offset + take]);
                    offset += take;
                    if data.len() == *expected {
                        frames.push(EnvelopeFrame {
                            compressed: *compressed,
                            payload: std::mem::take(data),
                        });
                        self.frames_emitted += 1;
                        self.state = State::Header {
                            bytes: [0_u8; 5],
                            filled: 0,
                        };
                    } else {
                        break;
                    }
                }
                State::Failed => break,
            }
        }

        Ok(frames)
    }

    /// Signals end-of-body. A partially buffered frame at that point means
    /// the stream was cut mid-frame.
    pub fn finish(&mut self) -> Result<(), EnvelopeError> {
        match &self.state {
            State::Header { filled, .. } if *filled > 0 => {
                let filled = *filled;
                self.state = State::Failed;
                Err(EnvelopeError::TruncatedFrame {
                    expected: 5,
                    missing: 5 - filled,
                })
            }
            State::Payload { expected, data, .. } => {
                let expected = *expected;
                let missing = expected - data.len();
                self.state = State::Failed;
                Err(EnvelopeError::TruncatedFrame { expected, missing })
            }
            _ => Ok(()),
        }
    }
}

/// Wire encoding of one envelope; the inverse of [`EnvelopeParser`].
pub fn encode_envelope(compressed: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(u8::from(compressed));
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
