//! Newline-delimited JSON framing
//!
//! Every ACP message travels as one JSON object on one line:
//! `<json>\n`
//!
//! The codec owns no protocol semantics. Lines that fail to parse are logged
//! and skipped so a single bad line never tears down the stream; blank lines
//! are skipped silently.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{trace, warn};

use crate::rpc::message::JsonRpcMessage;

/// Maximum line length accepted on the inbound side (16MB)
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Error types for NDJSON framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize a message to a single `\n`-terminated line
pub fn encode_line(message: &JsonRpcMessage) -> Result<String, FramingError> {
    // serde_json escapes control characters, so the body never contains '\n'
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line of text into a message
///
/// Returns `None` for blank lines and for lines that are not a JSON object of
/// the expected shape; the latter are logged.
pub fn parse_line(line: &str) -> Option<JsonRpcMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(
                error = %e,
                len = trimmed.len(),
                line = %line_preview(trimmed),
                "Skipping malformed line"
            );
            None
        }
    }
}

/// Characters of a malformed line kept in logs
const PREVIEW_CHARS: usize = 120;

/// Start of `line`, cut on a character boundary
fn line_preview(line: &str) -> &str {
    match line.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

/// NDJSON codec for [`FramedRead`](tokio_util::codec::FramedRead) and
/// [`FramedWrite`](tokio_util::codec::FramedWrite)
#[derive(Debug)]
pub struct NdjsonCodec {
    lines: LinesCodec,
}

impl NdjsonCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit
    pub fn with_max_line_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    /// Drive `next_line` until it yields a parseable message or runs dry
    fn next_message<F>(
        &mut self,
        src: &mut BytesMut,
        mut next_line: F,
    ) -> Result<Option<JsonRpcMessage>, FramingError>
    where
        F: FnMut(&mut LinesCodec, &mut BytesMut) -> Result<Option<String>, LinesCodecError>,
    {
        loop {
            match next_line(&mut self.lines, src) {
                Ok(Some(line)) => {
                    if let Some(message) = parse_line(&line) {
                        trace!("NdjsonCodec: Decoded message ({} bytes)", line.len());
                        return Ok(Some(message));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    // LinesCodec discards the rest of the oversized line itself
                    warn!("Skipping line longer than {} bytes", MAX_LINE_BYTES);
                }
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(error = %e, "Skipping line that is not valid UTF-8");
                }
                Err(LinesCodecError::Io(e)) => return Err(FramingError::Io(e)),
            }
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = JsonRpcMessage;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, |lines, buf| lines.decode(buf))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, |lines, buf| lines.decode_eof(buf))
    }
}

impl Encoder<&JsonRpcMessage> for NdjsonCodec {
    type Error = FramingError;

    fn encode(&mut self, item: &JsonRpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_string(item)?;
        self.lines.encode(body, dst).map_err(|e| match e {
            LinesCodecError::Io(io) => FramingError::Io(io),
            LinesCodecError::MaxLineLengthExceeded => {
                FramingError::Io(io::Error::other("line too long"))
            }
        })
    }
}
