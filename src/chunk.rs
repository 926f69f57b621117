//! Framed-record vocabulary shared by the codec, the flushers, and the supervisor.

use chrono::{DateTime, Utc};

use crate::codec::DecodeError;

/// Child standard output, captured through the PTY master.
pub const STREAM_STDOUT: &str = "stdout";
/// Child standard error, captured through a pipe.
pub const STREAM_STDERR: &str = "stderr";
/// Bytes injected into the child from external input; logged for audit.
pub const STREAM_STDIN: &str = "stdin";
/// Control command interpreted by the socket intake; never logged as content.
pub const STREAM_SIGNAL: &str = "signal";

/// Upper bound on stream label length in a frame header.
pub const MAX_STREAM_LABEL_LEN: usize = 64;

/// One framed record: stream label, UTC timestamp, raw payload bytes.
///
/// The payload is opaque: any byte value, any number of embedded newlines,
/// possibly empty. A chunk is never mutated after construction. The `error`
/// slot is set only on the sentinel record a reader emits when decoding
/// fails, carrying the failure out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub stream: String,
    pub ts: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub error: Option<DecodeError>,
}

impl Chunk {
    pub fn new(stream: impl Into<String>, ts: DateTime<Utc>, payload: Vec<u8>) -> Self {
        Self {
            stream: stream.into(),
            ts,
            payload,
            error: None,
        }
    }

    /// Build a chunk timestamped at the moment of the call.
    pub fn now(stream: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(stream, Utc::now(), payload)
    }

    /// Sentinel record carrying a decode failure; ends a record sequence.
    pub fn decode_failure(error: DecodeError) -> Self {
        Self {
            stream: String::new(),
            ts: Utc::now(),
            payload: Vec::new(),
            error: Some(error),
        }
    }
}

/// Whether `label` is a legal stream label: `[A-Za-z0-9_./-]{1,64}`.
pub fn is_valid_stream_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_STREAM_LABEL_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b'-'))
}

/// Format a UTC instant with fixed nanosecond width, e.g.
/// `2024-05-01T12:00:00.000000000Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

/// Parse an RFC-3339 UTC instant; any fractional width (including none) is
/// accepted.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
