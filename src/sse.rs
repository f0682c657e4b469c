//! Server-Sent Events framing
//!
//! Parses an SSE byte stream into typed events following the WHATWG rules:
//! lines are separated by `\r\n`, `\n`, or `\r`; `event:` sets the type of
//! the next event (default `message`); `data:` lines accumulate and are
//! joined with `\n`; `id:` and `retry:` are accepted but ignored; a line
//! starting with `:` is a comment; a blank line dispatches the accumulated
//! event. An event with no accumulated data is not dispatched.
//!
//! Two guards protect the consumer:
//!
//! - a maximum line length (default 1 MiB) — exceeding it is fatal and
//!   closes the transport;
//! - an optional idle timeout — if no bytes arrive for the configured
//!   duration the stream fails with [`SseError::Timeout`]. Any received
//!   chunk resets the timer.
//!
//! [`read_sse_stream`] drives a byte stream to completion and returns
//! exactly once, which doubles as the stream's completion signal.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Default maximum length of a single SSE line: 1 MiB.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Errors produced while reading an SSE stream.
#[derive(Error, Debug)]
pub enum SseError {
    /// A single line exceeded the configured maximum length
    #[error("SSE maximum line length exceeded: {length} > {max}")]
    LineLengthExceeded {
        /// Observed length in bytes
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// No bytes were received within the idle timeout
    #[error("SSE stream timed out after {0:?} with no data received")]
    Timeout(Duration),

    /// Transport-level read failure
    #[error("SSE stream I/O error: {0}")]
    Io(#[from] io::Error),

    /// The event handler rejected an event
    #[error("SSE event handler error: {0}")]
    Handler(String),
}

/// A single parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the stream did not set one
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
}

/// Options controlling [`read_sse_stream`].
#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Maximum length of a single line before the stream is failed
    pub max_line_length: usize,
    /// Idle timeout; `None` disables the guard
    pub idle_timeout: Option<Duration>,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout: None,
        }
    }
}

/// Splits a byte stream into lines on `\r\n`, `\n`, or `\r`.
///
/// A lone `\r` at the end of the buffer is held back until the next byte
/// arrives so a `\r\n` pair split across chunks is not mistaken for two
/// separators. Enforces the maximum line length on both complete and
/// still-unterminated lines.
pub struct SseLineDecoder {
    max_length: usize,
}

impl SseLineDecoder {
    /// Create a decoder enforcing the given maximum line length.
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Decoder for SseLineDecoder {
    type Item = String;
    type Error = SseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, SseError> {
        match src.iter().position(|b| *b == b'\r' || *b == b'\n') {
            Some(pos) => {
                if pos > self.max_length {
                    return Err(SseError::LineLengthExceeded {
                        length: pos,
                        max: self.max_length,
                    });
                }
                if src[pos] == b'\r' && pos + 1 == src.len() {
                    // Could be the first half of a \r\n pair; wait for more.
                    return Ok(None);
                }
                let line = src.split_to(pos);
                let crlf = src[0] == b'\r' && src.get(1) == Some(&b'\n');
                src.advance(if crlf { 2 } else { 1 });
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(SseError::LineLengthExceeded {
                        length: src.len(),
                        max: self.max_length,
                    });
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, SseError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final line, possibly with a held-back trailing \r.
        let line = src.split_to(src.len());
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => &line[..],
        };
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }
}

/// Accumulates SSE field lines and emits complete events.
#[derive(Debug)]
pub struct SseParser {
    event: String,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Create a parser with the default event type.
    pub fn new() -> Self {
        Self {
            event: "message".to_string(),
            data_lines: Vec::new(),
        }
    }

    /// Feed one line; returns a complete event when the line dispatches one.
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        let (field, value) = parse_field_value(line)?;
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            // id and retry are accepted but not implemented
            "id" | "retry" => {}
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let data_lines = std::mem::take(&mut self.data_lines);
        let event = std::mem::replace(&mut self.event, "message".to_string());

        // Empty data accumulation dispatches nothing.
        if data_lines.is_empty() {
            return None;
        }

        Some(SseEvent {
            event,
            data: data_lines.join("\n"),
        })
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a field line into `(field, value)`.
///
/// Comment lines (leading `:`) yield `None`. A line without a colon is a
/// field with an empty value. A single space after the colon is stripped.
fn parse_field_value(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(':') {
        return None;
    }
    match line.split_once(':') {
        Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
        None => Some((line, "")),
    }
}

/// Drive an SSE byte stream to completion.
///
/// Every parsed event is passed to `handler`; a handler error aborts the
/// read. Returns `Ok(())` on normal end-of-stream, or the first error
/// encountered. Either way the function returns exactly once and the
/// transport is dropped, which releases the underlying connection.
pub async fn read_sse_stream<S, F>(
    byte_stream: S,
    opts: SseOptions,
    mut handler: F,
) -> Result<(), SseError>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    F: FnMut(SseEvent) -> Result<(), SseError>,
{
    let stream: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> = match opts.idle_timeout {
        Some(timeout) => Box::pin(
            tokio_stream::StreamExt::timeout(byte_stream, timeout).map(|item| match item {
                Ok(inner) => inner,
                Err(_elapsed) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no data received within the SSE timeout",
                )),
            }),
        ),
        None => Box::pin(byte_stream),
    };

    let reader = StreamReader::new(stream);
    let mut frames = FramedRead::new(reader, SseLineDecoder::new(opts.max_line_length));
    let mut parser = SseParser::new();

    while let Some(item) = frames.next().await {
        match item {
            Ok(line) => {
                if let Some(event) = parser.feed_line(&line) {
                    handler(event)?;
                }
            }
            Err(SseError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(SseError::Timeout(opts.idle_timeout.unwrap_or_default()));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
