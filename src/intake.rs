//! Control-socket intake: accepts framed `stdin`/`signal` records over a
//! local Unix socket and relays them to the child.
//!
//! Connection end is not child end: after a client disconnects, the server
//! accepts again until the supervisor stops it at child reap.

use std::fs;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::chunk::{STREAM_SIGNAL, STREAM_STDIN};
use crate::codec::{LogReader, LogWriter};
use crate::pty;
use crate::signals::{parse_signal, signal_process_group_or_pid};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(100);

/// A running intake task. Owned by the supervisor and stopped when the
/// child is reaped.
pub struct ControlSocket {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    delivered: Arc<AtomicI32>,
    join: thread::JoinHandle<()>,
}

impl ControlSocket {
    /// Bind `path` and start relaying. `master` is a dup of the PTY master
    /// used as the child's input endpoint; `writer` receives audit copies of
    /// forwarded stdin bytes.
    pub fn spawn(
        path: &Path,
        master: OwnedFd,
        child_pid: i32,
        writer: LogWriter,
    ) -> Result<ControlSocket> {
        // A stale socket file from an earlier run would make bind fail.
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind control socket {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("set control socket non-blocking")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicI32::new(0));
        let join = {
            let shutdown = Arc::clone(&shutdown);
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                accept_loop(&listener, &master, child_pid, &writer, &shutdown, &delivered);
            })
        };
        Ok(ControlSocket {
            path: path.to_path_buf(),
            shutdown,
            delivered,
            join,
        })
    }

    /// Stop accepting, join the intake thread, and remove the socket file.
    /// Returns the last signal delivered through the socket, if any.
    pub fn stop(self) -> Option<i32> {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.join.join();
        let _ = fs::remove_file(&self.path);
        let signo = self.delivered.load(Ordering::SeqCst);
        (signo > 0).then_some(signo)
    }
}

fn accept_loop(
    listener: &UnixListener,
    master: &OwnedFd,
    child_pid: i32,
    writer: &LogWriter,
    shutdown: &Arc<AtomicBool>,
    delivered: &Arc<AtomicI32>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) =
                    serve_connection(stream, master, child_pid, writer, shutdown, delivered)
                {
                    warn!(error = %err, "control connection failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "control socket accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// One connection at a time: parse frames off the stream and relay them.
fn serve_connection(
    stream: UnixStream,
    master: &OwnedFd,
    child_pid: i32,
    writer: &LogWriter,
    shutdown: &Arc<AtomicBool>,
    delivered: &Arc<AtomicI32>,
) -> Result<()> {
    stream
        .set_read_timeout(Some(READ_POLL))
        .context("set control connection read timeout")?;
    let guarded = ShutdownRead {
        inner: stream,
        shutdown: Arc::clone(shutdown),
    };
    for chunk in LogReader::new(guarded).chunks() {
        if let Some(error) = chunk.error {
            warn!(error = %error, "control frame decode failed, dropping connection");
            break;
        }
        match chunk.stream.as_str() {
            STREAM_STDIN => {
                pty::write_all(master.as_raw_fd(), &chunk.payload)
                    .context("forward stdin bytes to child")?;
                writer.append(STREAM_STDIN, &chunk.payload);
            }
            STREAM_SIGNAL => match parse_signal(&chunk.payload) {
                Some(signo) => {
                    match signal_process_group_or_pid(child_pid, signo, true) {
                        Ok(()) => delivered.store(signo, Ordering::SeqCst),
                        Err(err) => {
                            warn!(signal = signo, error = %err, "signal delivery failed")
                        }
                    }
                }
                None => warn!(
                    payload = %String::from_utf8_lossy(&chunk.payload),
                    "unparseable signal payload"
                ),
            },
            other => {
                warn!(stream = %other, "ignoring control frame for unrecognized stream");
            }
        }
    }
    debug!("control connection closed");
    Ok(())
}

/// Read adapter that turns read timeouts into retries until shutdown, then
/// reports EOF, so a frame decode in progress ends cleanly instead of
/// wedging the intake thread.
struct ShutdownRead {
    inner: UnixStream,
    shutdown: Arc<AtomicBool>,
}

impl Read for ShutdownRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}
