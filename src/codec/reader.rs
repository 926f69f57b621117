//! Blocking frame reader exposing channel, per-stream, and whole-log views.
//!
//! All views share one sequential parse of the source; construct at most one
//! view per source.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read};
use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::chunk::Chunk;
use crate::codec::{read_chunk, DecodeError, QUEUE_CAPACITY};

pub struct LogReader<R: Read> {
    source: BufReader<R>,
}

impl<R: Read> LogReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source: BufReader::new(source),
        }
    }

    /// Lazy sequence of decoded chunks. Ends at EOF; a decode error yields
    /// one sentinel chunk carrying the error, then the sequence ends.
    pub fn chunks(self) -> Chunks<R> {
        Chunks {
            source: self.source,
            finished: false,
        }
    }

    /// Per-stream byte view: a reader over the concatenated payloads of
    /// `label`, transparently skipping chunks of other streams.
    pub fn stream_contents(self, label: impl Into<String>) -> StreamContents<R> {
        StreamContents {
            source: self.source,
            label: label.into(),
            pending: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    /// Read the whole source into stream label → concatenated payload bytes.
    pub fn read_all(self) -> Result<BTreeMap<String, Vec<u8>>, DecodeError> {
        let mut source = self.source;
        let mut streams: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        while let Some(chunk) = read_chunk(&mut source)? {
            streams
                .entry(chunk.stream)
                .or_default()
                .extend_from_slice(&chunk.payload);
        }
        Ok(streams)
    }
}

impl<R: Read + Send + 'static> LogReader<R> {
    /// Drain the source on a thread into a bounded channel; sentinel
    /// semantics as in [`LogReader::chunks`].
    pub fn into_channel(self) -> (Receiver<Chunk>, thread::JoinHandle<()>) {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let chunks = self.chunks();
        let join = thread::spawn(move || {
            for chunk in chunks {
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        });
        (rx, join)
    }
}

pub struct Chunks<R: Read> {
    source: BufReader<R>,
    finished: bool,
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.finished {
            return None;
        }
        match read_chunk(&mut self.source) {
            Ok(Some(chunk)) => Some(chunk),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(error) => {
                self.finished = true;
                Some(Chunk::decode_failure(error))
            }
        }
    }
}

pub struct StreamContents<R: Read> {
    source: BufReader<R>,
    label: String,
    pending: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> Read for StreamContents<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            if self.finished {
                return Ok(0);
            }
            match read_chunk(&mut self.source) {
                Ok(Some(chunk)) if chunk.stream == self.label => {
                    self.pending = chunk.payload;
                    self.pos = 0;
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.finished = true;
                    return Ok(0);
                }
                Err(error) => {
                    self.finished = true;
                    return Err(io::Error::new(io::ErrorKind::InvalidData, error));
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
