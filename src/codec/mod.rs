//! Length-prefixed, binary-safe frame codec for multi-stream output logs.
//!
//! Frame grammar, all ASCII except the payload:
//!
//! ```text
//! stream SP timestamp SP length ":" SP payload LF
//! ```
//!
//! The reader consumes exactly `length` payload bytes after the `": "`
//! separator, so payloads that embed text resembling a header can never
//! confuse the parser. Decode errors are fatal to the record sequence; no
//! resynchronization is attempted.

mod reader;
mod writer;

pub use reader::{Chunks, LogReader, StreamContents};
pub use writer::{LogWriter, WriterHandle, DEFAULT_SEND_TIMEOUT, QUEUE_CAPACITY};

use std::io::Read;

use thiserror::Error;

use crate::chunk::{self, Chunk, MAX_STREAM_LABEL_LEN};

/// Refuse to allocate payloads beyond this; a longer declared length is
/// treated as a corrupt header.
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// Why a frame failed to decode. Any of these ends the record sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input inside a frame header")]
    UnexpectedEofInHeader,
    #[error("invalid stream label {0:?}")]
    InvalidStream(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("invalid payload length {0:?}")]
    InvalidLength(String),
    #[error("missing space after the length colon")]
    MissingSpaceAfterColon,
    #[error("payload ended after {got} of {want} bytes")]
    ShortPayload { want: usize, got: usize },
    #[error("missing LF terminator after payload")]
    MissingTerminator,
    #[error("frame read failed: {0}")]
    Io(String),
}

/// Encode one chunk as `header || payload || LF`.
///
/// An empty payload is legal and yields `"stream ts 0: \n"`.
pub fn encode(chunk: &Chunk) -> Vec<u8> {
    let header = format!(
        "{} {} {}: ",
        chunk.stream,
        chunk::format_timestamp(&chunk.ts),
        chunk.payload.len()
    );
    let mut frame = Vec::with_capacity(header.len() + chunk.payload.len() + 1);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&chunk.payload);
    frame.push(b'\n');
    frame
}

/// Decode the next frame from `source`.
///
/// `Ok(None)` means clean EOF at a frame boundary; EOF anywhere inside a
/// frame is an error.
pub fn read_chunk<R: Read>(source: &mut R) -> Result<Option<Chunk>, DecodeError> {
    let token = match read_token(source, b' ', true)? {
        None => return Ok(None),
        Some(token) => token,
    };
    let stream = match String::from_utf8(token) {
        Ok(label) if chunk::is_valid_stream_label(&label) => label,
        Ok(label) => return Err(DecodeError::InvalidStream(label)),
        Err(e) => return Err(DecodeError::InvalidStream(preview(e.as_bytes()))),
    };

    let ts_token = read_token(source, b' ', false)?.ok_or(DecodeError::UnexpectedEofInHeader)?;
    let ts_text =
        String::from_utf8(ts_token).map_err(|e| DecodeError::InvalidTimestamp(preview(e.as_bytes())))?;
    let ts = chunk::parse_timestamp(&ts_text).ok_or_else(|| DecodeError::InvalidTimestamp(ts_text.clone()))?;

    let len_token = read_token(source, b':', false)?.ok_or(DecodeError::UnexpectedEofInHeader)?;
    let len = parse_length(&len_token)?;

    match read_byte(source)? {
        Some(b' ') => {}
        Some(_) => return Err(DecodeError::MissingSpaceAfterColon),
        None => return Err(DecodeError::UnexpectedEofInHeader),
    }

    let mut payload = vec![0u8; len];
    let mut got = 0;
    while got < len {
        match source.read(&mut payload[got..]) {
            Ok(0) => return Err(DecodeError::ShortPayload { want: len, got }),
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DecodeError::Io(e.to_string())),
        }
    }

    match read_byte(source)? {
        Some(b'\n') => Ok(Some(Chunk::new(stream, ts, payload))),
        _ => Err(DecodeError::MissingTerminator),
    }
}

fn parse_length(token: &[u8]) -> Result<usize, DecodeError> {
    let text = std::str::from_utf8(token).map_err(|_| DecodeError::InvalidLength(preview(token)))?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidLength(text.to_string()));
    }
    let len: usize = text
        .parse()
        .map_err(|_| DecodeError::InvalidLength(text.to_string()))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::InvalidLength(text.to_string()));
    }
    Ok(len)
}

/// Read bytes up to (not including) `delim`. `Ok(None)` only when
/// `eof_at_start_ok` and the source is exhausted before the first byte.
fn read_token<R: Read>(
    source: &mut R,
    delim: u8,
    eof_at_start_ok: bool,
) -> Result<Option<Vec<u8>>, DecodeError> {
    let mut token = Vec::new();
    loop {
        match read_byte(source)? {
            None if token.is_empty() && eof_at_start_ok => return Ok(None),
            None => return Err(DecodeError::UnexpectedEofInHeader),
            Some(b) if b == delim => return Ok(Some(token)),
            Some(b) => {
                token.push(b);
                // Headers are short; a runaway token means we are not
                // looking at a header at all.
                if token.len() > MAX_STREAM_LABEL_LEN + 64 {
                    return Err(DecodeError::InvalidStream(preview(&token)));
                }
            }
        }
    }
}

fn read_byte<R: Read>(source: &mut R) -> Result<Option<u8>, DecodeError> {
    let mut byte = [0u8; 1];
    loop {
        match source.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DecodeError::Io(e.to_string())),
        }
    }
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(32)]).into_owned()
}
