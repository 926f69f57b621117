//! Minimal content-type detection over a captured output prefix.

/// How many leading stdout bytes the supervisor captures for sniffing.
pub const SNIFF_LEN: usize = 512;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

const MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"\x1f\x8b", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x7fELF", OCTET_STREAM),
];

const HTML_PREFIXES: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head",
    "<body",
    "<script",
    "<table",
    "<div",
];

/// Detect a MIME type for `data` (at most the first [`SNIFF_LEN`] bytes are
/// considered). Empty input sniffs as plain text.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    if data.is_empty() {
        return TEXT_PLAIN;
    }

    if data.starts_with(&[0xef, 0xbb, 0xbf]) {
        return TEXT_PLAIN;
    }
    if data.starts_with(&[0xfe, 0xff]) || data.starts_with(&[0xff, 0xfe]) {
        return "text/plain; charset=utf-16";
    }

    for (magic, mime) in MAGIC {
        if data.starts_with(magic) {
            return mime;
        }
    }

    let trimmed = trim_leading_whitespace(data);
    if let Ok(text) = std::str::from_utf8(trimmed) {
        let lowered = text.to_ascii_lowercase();
        if HTML_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            return "text/html; charset=utf-8";
        }
        if lowered.starts_with("<?xml") {
            return "text/xml; charset=utf-8";
        }
    }

    if looks_binary(data) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN
    }
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0c))
        .unwrap_or(data.len());
    &data[start..]
}

/// A control byte outside the usual text repertoire marks binary data. A
/// truncated trailing UTF-8 sequence does not.
fn looks_binary(data: &[u8]) -> bool {
    if data
        .iter()
        .any(|&b| (b < 0x20 && !matches!(b, 0x09 | 0x0a | 0x0c | 0x0d | 0x1b)) || b == 0x7f)
    {
        return true;
    }
    match std::str::from_utf8(data) {
        Ok(_) => false,
        Err(e) => e.error_len().is_some(),
    }
}
