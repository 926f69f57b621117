//! Serializing log writer: many producers, one drainer thread, whole frames
//! only.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tracing::warn;

use crate::chunk::Chunk;
use crate::codec::encode;

/// Bounded submission queue between producers and the drainer.
pub const QUEUE_CAPACITY: usize = 100;

/// How long a producer blocks on a full queue before dropping the chunk.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable producer handle. The sink is written only by the drainer
/// thread, so interleaved producers can never tear a frame. Closing the
/// writer means dropping every handle; further appends are impossible by
/// construction.
#[derive(Clone)]
pub struct LogWriter {
    tx: Sender<Chunk>,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

/// Held by the owner of the writer; `wait` blocks until the queue has
/// drained and the sink has seen every surviving frame.
pub struct WriterHandle {
    join: thread::JoinHandle<io::Result<()>>,
    dropped: Arc<AtomicU64>,
}

impl LogWriter {
    pub fn spawn<W: Write + Send + 'static>(sink: W) -> (LogWriter, WriterHandle) {
        Self::spawn_with_timeout(sink, DEFAULT_SEND_TIMEOUT)
    }

    /// As `spawn`, with the producer blocking bound overridden (tests use a
    /// short bound to exercise the drop path).
    pub fn spawn_with_timeout<W: Write + Send + 'static>(
        sink: W,
        send_timeout: Duration,
    ) -> (LogWriter, WriterHandle) {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let join = thread::spawn(move || drain(rx, sink));
        (
            LogWriter {
                tx,
                send_timeout,
                dropped: Arc::clone(&dropped),
            },
            WriterHandle { join, dropped },
        )
    }

    /// Append a payload under `stream`, timestamped at the time of this
    /// call. The bytes are copied before the call returns, so the caller may
    /// reuse its buffer immediately.
    pub fn append(&self, stream: &str, payload: &[u8]) {
        self.submit(Chunk::now(stream, payload.to_vec()));
    }

    /// Submit a pre-timestamped record.
    ///
    /// Blocks for up to the configured send timeout when the queue is full,
    /// then drops the chunk with a warning. Dropping is observable through
    /// [`LogWriter::dropped_chunks`]; frames are never torn.
    pub fn submit(&self, chunk: Chunk) {
        match self.tx.send_timeout(chunk, self.send_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(chunk)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream = %chunk.stream,
                    bytes = chunk.payload.len(),
                    "output queue full, dropping chunk"
                );
            }
            Err(SendTimeoutError::Disconnected(chunk)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream = %chunk.stream,
                    bytes = chunk.payload.len(),
                    "output writer already closed, dropping chunk"
                );
            }
        }
    }

    /// Chunks dropped so far because the queue stayed full past the bound.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl WriterHandle {
    /// Wait for the drainer to finish. Returns the sink's terminal result;
    /// an early sink failure is reported here while later frames were
    /// consumed and discarded.
    pub fn wait(self) -> io::Result<()> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("log writer thread panicked")))
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn drain<W: Write>(rx: Receiver<Chunk>, mut sink: W) -> io::Result<()> {
    let mut result = Ok(());
    for chunk in rx.iter() {
        if result.is_ok() {
            result = sink.write_all(&encode(&chunk));
            if let Err(e) = &result {
                warn!(error = %e, "output log write failed; discarding remaining frames");
            }
        }
    }
    if result.is_ok() {
        result = sink.flush();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{STREAM_STDERR, STREAM_STDOUT};
    use crate::codec::{read_chunk, LogReader};
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Sink shared with the test through an Arc so the written bytes can be
    /// inspected after the drainer exits.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Sink that refuses to make progress until the gate channel is closed.
    struct GatedSink(Receiver<()>);

    impl Write for GatedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // recv returns Err once the test drops the sender; either way we
            // were blocked until then.
            let _ = self.0.recv();
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frames_preserve_per_producer_order() {
        let sink = SharedSink::default();
        let bytes = sink.0.clone();
        let (writer, handle) = LogWriter::spawn(sink);

        for i in 0..250 {
            writer.append(STREAM_STDOUT, format!("line {i}\n").as_bytes());
        }
        drop(writer);
        handle.wait().expect("drain");

        let written = bytes.lock().expect("sink lock").clone();
        let mut cursor = Cursor::new(written);
        let mut seen = 0;
        while let Some(chunk) = read_chunk(&mut cursor).expect("decode") {
            assert_eq!(chunk.stream, STREAM_STDOUT);
            assert_eq!(chunk.payload, format!("line {seen}\n").into_bytes());
            seen += 1;
        }
        assert_eq!(seen, 250);
    }

    #[test]
    fn concurrent_producers_never_tear_frames() {
        let sink = SharedSink::default();
        let bytes = sink.0.clone();
        let (writer, handle) = LogWriter::spawn(sink);

        let producers: Vec<_> = [STREAM_STDOUT, STREAM_STDERR]
            .into_iter()
            .map(|stream| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        writer.append(stream, format!("{stream} {i}\n").as_bytes());
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().expect("producer");
        }
        drop(writer);
        handle.wait().expect("drain");

        let written = bytes.lock().expect("sink lock").clone();
        let per_stream = LogReader::new(Cursor::new(written))
            .read_all()
            .expect("well-formed log");
        for stream in [STREAM_STDOUT, STREAM_STDERR] {
            let expected: Vec<u8> = (0..100)
                .flat_map(|i| format!("{stream} {i}\n").into_bytes())
                .collect();
            assert_eq!(per_stream[stream], expected, "stream {stream}");
        }
    }

    #[test]
    fn full_queue_drops_are_bounded_and_counted() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (writer, handle) =
            LogWriter::spawn_with_timeout(GatedSink(gate_rx), Duration::from_millis(20));

        // One chunk is pulled by the drainer and stuck in the sink; the rest
        // fill the queue, and the overflow must be dropped, not corrupted.
        let submitted = QUEUE_CAPACITY + 10;
        for i in 0..submitted {
            writer.append(STREAM_STDOUT, format!("{i}").as_bytes());
        }
        assert!(writer.dropped_chunks() >= 1);
        let dropped = writer.dropped_chunks();
        assert!(
            dropped as usize <= submitted - QUEUE_CAPACITY,
            "dropped {dropped} of {submitted}"
        );
        assert_eq!(handle.dropped_chunks(), dropped);

        drop(gate_tx);
        drop(writer);
        handle.wait().expect("drain");
    }
}
