//! Output-kind classification fed by decoded stdout chunks.
//!
//! The classifier decides once, on the first chunk that gives it enough
//! evidence, what kind of output the child is producing so downstream
//! consumers can pick a renderer. The scoring rules are deliberately
//! simple; the stable part is the contract: `analyze` is called at most
//! once per stdout chunk until it returns true, and the verdict is written
//! exactly once.

use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::procdir::ProcessDir;
use crate::sniff::SNIFF_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Unknown,
    Binary,
    Text,
    Fullscreen,
    Ink,
    Markdown,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Unknown => "unknown",
            OutputKind::Binary => "binary",
            OutputKind::Text => "text",
            OutputKind::Fullscreen => "fullscreen",
            OutputKind::Ink => "ink",
            OutputKind::Markdown => "markdown",
        }
    }
}

/// Stateful detector over the child's stdout chunks.
pub trait OutputClassifier: Send {
    /// Inspect one chunk; returns true once a verdict is reached. Not
    /// called again after that. Payloads arrive exactly as flushed; CR-only
    /// partial lines are not pre-split.
    fn analyze(&mut self, chunk: &[u8]) -> bool;

    /// The verdict after detection; `(Unknown, "")` before.
    fn verdict(&self) -> (OutputKind, String);
}

/// Default rules: alternate-screen and cursor escapes mark interactive
/// programs, NUL bytes mark binary dumps, markdown markers mark documents,
/// and enough unremarkable chunks settle on plain text.
pub struct HeuristicClassifier {
    plain_chunks: usize,
    verdict: Option<(OutputKind, String)>,
}

/// Unremarkable chunks seen before settling on `text`.
const PLAIN_CHUNK_THRESHOLD: usize = 8;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self {
            plain_chunks: 0,
            verdict: None,
        }
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClassifier for HeuristicClassifier {
    fn analyze(&mut self, chunk: &[u8]) -> bool {
        if self.verdict.is_some() {
            return true;
        }
        if chunk.contains(&0) {
            self.verdict = Some((OutputKind::Binary, "NUL byte in output".to_string()));
        } else if contains(chunk, b"\x1b[?1049h") || contains(chunk, b"\x1b[2J") {
            self.verdict = Some((
                OutputKind::Fullscreen,
                "alternate screen switch".to_string(),
            ));
        } else if contains(chunk, b"\x1b[?25l") {
            self.verdict = Some((
                OutputKind::Ink,
                "cursor hidden without alternate screen".to_string(),
            ));
        } else if chunk.starts_with(b"# ") || chunk.starts_with(b"## ") || chunk.starts_with(b"```")
        {
            self.verdict = Some((OutputKind::Markdown, "markdown heading or fence".to_string()));
        } else {
            self.plain_chunks += 1;
            if self.plain_chunks >= PLAIN_CHUNK_THRESHOLD {
                self.verdict = Some((OutputKind::Text, "plain output".to_string()));
            }
        }
        self.verdict.is_some()
    }

    fn verdict(&self) -> (OutputKind, String) {
        self.verdict
            .clone()
            .unwrap_or((OutputKind::Unknown, String::new()))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Consume stdout chunks off the tap: run the classifier until it detects
/// (writing `output-type` once), and accumulate the leading bytes for the
/// content-type sniff. Returns the sniff prefix when the tap closes.
pub fn spawn_classifier(
    tap: Receiver<Chunk>,
    mut classifier: Box<dyn OutputClassifier>,
    dir: ProcessDir,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut prefix: Vec<u8> = Vec::new();
        let mut detected = false;
        for chunk in tap.iter() {
            if prefix.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - prefix.len()).min(chunk.payload.len());
                prefix.extend_from_slice(&chunk.payload[..take]);
            }
            if !detected && classifier.analyze(&chunk.payload) {
                detected = true;
                let (kind, reason) = classifier.verdict();
                debug!(kind = kind.as_str(), reason = %reason, "output type detected");
                if let Err(err) = dir.write_output_type(kind, &reason) {
                    warn!(error = %err, "failed to write output-type");
                }
            }
        }
        prefix
    })
}
