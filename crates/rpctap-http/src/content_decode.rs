use std::io::{self, Read, Write};

use flate2::write::{DeflateDecoder, GzDecoder};

/// Push-based Content-Encoding decoder chain. Stages are composed in header
/// order, mirroring how the recorded traffic actually layers them; unknown
/// encodings pass bytes through untouched. Gzip and deflate decode
/// incrementally; brotli input is buffered and decoded at end-of-body.
pub struct ContentDecoder {
    stages: Vec<Stage>,
}

enum Stage {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(DeflateDecoder<Vec<u8>>),
    Brotli { input: Vec<u8> },
    Passthrough,
}

impl ContentDecoder {
    pub fn new(encodings: &[String]) -> Self {
        let stages = encodings
            .iter()
            .map(|encoding| match encoding.as_str() {
                "gzip" | "x-gzip" => Stage::Gzip(GzDecoder::new(Vec::new())),
                "deflate" => Stage::Deflate(DeflateDecoder::new(Vec::new())),
                "br" => Stage::Brotli { input: Vec::new() },
                _ => Stage::Passthrough,
            })
            .collect();
        Self { stages }
    }

    pub fn is_identity(&self) -> bool {
        self.stages
            .iter()
            .all(|stage| matches!(stage, Stage::Passthrough))
    }

    pub fn push(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut carry = data.to_vec();
        for stage in &mut self.stages {
            if carry.is_empty() {
                break;
            }
            carry = stage.push(&carry)?;
        }
        Ok(carry)
    }

    /// Flushes every stage at end-of-body and returns the decoded tail.
    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        let mut carry: Vec<u8> = Vec::new();
        for stage in &mut self.stages {
            let mut output = if carry.is_empty() {
                Vec::new()
            } else {
                stage.push(&carry)?
            };
            output.extend(stage.finish()?);
            carry = output;
        }
        Ok(carry)
    }
}

impl Stage {
    fn push(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(decoder) => {
                decoder.write_all(data)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Deflate(decoder) => {
                decoder.write_all(data)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Brotli { input } => {
                input.extend_from_slice(data);
                Ok(Vec::new())
            }
            Self::Passthrough => Ok(data.to_vec()),
        }
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Self::Brotli { input } => {
                let mut decoded = Vec::new();
                let mut reader = brotli::Decompressor::new(input.as_slice(), 4096);
                reader.read_to_end(&mut decoded)?;
                input.clear();
                Ok(decoded)
            }
            Self::Passthrough => Ok(Vec::new()),
        }
    }
}
