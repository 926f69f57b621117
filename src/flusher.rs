//! Byte-level reader that turns raw child output into timestamped chunks,
//! flushing on newline or a short idle gap.
//!
//! Interactive programs print prompts without a trailing newline and then
//! block on input; a plain line scanner would withhold the prompt forever.
//! The idle flush makes such partial lines visible promptly without
//! fragmenting bursty output into per-byte chunks.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::codec::LogWriter;
use crate::pty;

/// Idle interval after which a partial line is flushed.
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(100);

const READ_BUF_LEN: usize = 4096;
const DONE_SIGNAL_WINDOW: Duration = Duration::from_secs(1);

/// A running flusher thread. The done signal fires within one second of the
/// read loop exiting, once every buffered byte has been handed to the
/// writer.
pub struct Flusher {
    join: thread::JoinHandle<()>,
    done: Receiver<()>,
}

impl Flusher {
    /// Start a flusher over `source`, emitting chunks labeled `stream` into
    /// `writer`. Chunks are also offered to `tap` (non-blocking) when given.
    pub fn spawn(
        source: OwnedFd,
        stream: &str,
        writer: LogWriter,
        tap: Option<Sender<Chunk>>,
        idle: Duration,
    ) -> io::Result<Flusher> {
        pty::set_nonblocking(source.as_raw_fd())?;
        let stream = stream.to_string();
        let (done_tx, done_rx) = bounded(1);
        let join = thread::spawn(move || {
            read_loop(&source, &stream, &writer, tap.as_ref(), idle);
            if done_tx.send_timeout((), DONE_SIGNAL_WINDOW).is_err() {
                warn!(stream = %stream, "flusher done signal missed its window");
            }
        });
        Ok(Flusher {
            join,
            done: done_rx,
        })
    }

    /// Wait up to `timeout` for the flusher's completion signal. Returns
    /// whether the signal arrived; on timeout the thread is left detached so
    /// a wedged source cannot wedge the caller.
    pub fn wait(self, timeout: Duration) -> bool {
        if self.done.recv_timeout(timeout).is_ok() {
            let _ = self.join.join();
            true
        } else {
            false
        }
    }
}

fn read_loop(
    source: &OwnedFd,
    stream: &str,
    writer: &LogWriter,
    tap: Option<&Sender<Chunk>>,
    idle: Duration,
) {
    let fd = source.as_raw_fd();
    let mut buf = [0u8; READ_BUF_LEN];
    let mut line: Vec<u8> = Vec::new();
    loop {
        // SAFETY: fd stays valid for the life of this loop (the OwnedFd is
        // borrowed by the thread), and buf is a writable stack buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            for &byte in &buf[..n as usize] {
                line.push(byte);
                if byte == b'\n' {
                    emit(stream, &mut line, writer, tap);
                }
            }
            continue;
        }
        if n == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                let timeout = if line.is_empty() { None } else { Some(idle) };
                match poll_readable(fd, timeout) {
                    Ok(true) => continue,
                    Ok(false) => emit(stream, &mut line, writer, tap),
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        debug!(stream = %stream, error = %e, "poll on output source failed");
                        break;
                    }
                }
            }
            // EIO is the normal PTY-master end once the last slave closes.
            _ => {
                debug!(stream = %stream, error = %err, "output source ended");
                break;
            }
        }
    }
    emit(stream, &mut line, writer, tap);
}

fn emit(stream: &str, line: &mut Vec<u8>, writer: &LogWriter, tap: Option<&Sender<Chunk>>) {
    if line.is_empty() {
        return;
    }
    let chunk = Chunk::now(stream, std::mem::take(line));
    if let Some(tap) = tap {
        if tap.try_send(chunk.clone()).is_err() {
            debug!(stream = %stream, "classifier tap not keeping up, skipping chunk");
        }
    }
    writer.submit(chunk);
}

/// Ok(true) when the fd is readable (or hung up), Ok(false) on timeout.
/// `None` blocks indefinitely.
fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = match timeout {
        Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
        None => -1,
    };
    // SAFETY: pollfd is a valid, initialized struct for the duration of the
    // call, and nfds is 1.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc > 0)
}
