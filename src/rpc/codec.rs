//! NDJSON codec for worker streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length and
//! parses every complete line into a [`serde_json::Value`]. Partial lines stay
//! buffered in the caller's `BytesMut` until their `\n` arrives, so a message
//! split across two reads decodes exactly once.
//!
//! Malformed lines never poison the stream: invalid UTF-8, invalid JSON and
//! over-long lines are logged at `WARN` and skipped, and decoding resumes at the next line.
//! Only I/O failures surface as errors.

use std::io::ErrorKind;

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum inbound line length accepted from a worker: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec for bidirectional worker streams.
///
/// # Decoder
///
/// Yields one [`Value`] per well-formed line. Blank lines, invalid UTF-8,
/// invalid JSON and lines longer than [`MAX_LINE_BYTES`] are dropped with a warning.
///
/// # Encoder
///
/// Writes compact JSON followed by `\n`. `serde_json` escapes control
/// characters inside strings, so an encoded value never contains a raw
/// newline.
#[derive(Debug)]
pub struct RpcCodec {
    lines: LinesCodec,
    max_length: usize,
    dropped: u64,
}

impl RpcCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
            dropped: 0,
        }
    }

    /// Number of inbound lines discarded as malformed or oversized.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn next_value(&mut self, src: &mut BytesMut, at_eof: bool) -> Result<Option<Value>> {
        loop {
            let decoded = if at_eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };

            match decoded {
                Ok(Some(line)) => {
                    if let Some(value) = self.parse_line(&line) {
                        return Ok(Some(value));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    // LinesCodec discards up to the next newline on the
                    // following call.
                    self.dropped += 1;
                    warn!(
                        max_bytes = self.max_length,
                        "rpc codec: line too long, discarding"
                    );
                }
                Err(LinesCodecError::Io(err)) if err.kind() == ErrorKind::InvalidData => {
                    // The offending line has already been consumed.
                    self.dropped += 1;
                    warn!(error = %err, "rpc codec: line is not valid utf-8, skipping");
                }
                Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Some(value),
            Err(err) => {
                self.dropped += 1;
                warn!(error = %err, raw_line = trimmed, "rpc codec: malformed json, skipping line");
                None
            }
        }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = Value;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_value(src, false)
    }

    /// Decode whatever remains at EOF, including an unterminated final line.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_value(src, true)
    }
}

impl Encoder<Value> for RpcCodec {
    type Error = AppError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&Value>::encode(self, &item, dst)
    }
}

impl Encoder<&Value> for RpcCodec {
    type Error = AppError;

    fn encode(&mut self, item: &Value, dst: &mut BytesMut) -> Result<()> {
        let line = encode_line(item)?;
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

/// Encode `value` as a single `\n`-terminated UTF-8 line.
///
/// # Errors
///
/// Returns [`AppError::Rpc`] if serialisation fails.
pub fn encode_line(value: &Value) -> Result<String> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| AppError::Rpc(format!("failed to serialise outbound message: {e}")))?;
    line.push('\n');
    Ok(line)
}
