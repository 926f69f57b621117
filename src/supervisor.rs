//! Lifecycle driver: spawn the child under a PTY, wire the stream flushers
//! and control intake, reap, and finalize the process record.

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::{info, warn};

use crate::chunk::{STREAM_STDERR, STREAM_STDOUT};
use crate::classify::{spawn_classifier, HeuristicClassifier, OutputClassifier};
use crate::codec::{LogWriter, QUEUE_CAPACITY};
use crate::flusher::{Flusher, DEFAULT_IDLE_FLUSH};
use crate::intake::ControlSocket;
use crate::procdir::ProcessDir;
use crate::pty::{self, ChildStatus, SpawnedChild, WINDOW_COLS, WINDOW_ROWS};
use crate::signals::signal_description;
use crate::sniff::detect_content_type;

/// Upper bound on waiting for each flusher's completion signal; a grandchild
/// keeping the PTY slave open must not wedge shutdown.
const FLUSHER_DONE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Command and arguments; the first element is the executable path.
    pub argv: Vec<String>,
    /// Directory receiving the record files and the output log.
    pub process_dir: PathBuf,
    /// Control socket path; no intake is started when absent.
    pub stdin_socket: Option<PathBuf>,
    /// Partial-line idle flush interval.
    pub idle_flush: Duration,
    /// TERM value exported to the child.
    pub term: String,
}

impl RunConfig {
    pub fn new(argv: Vec<String>, process_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            process_dir: process_dir.into(),
            stdin_socket: None,
            idle_flush: DEFAULT_IDLE_FLUSH,
            term: "xterm-256color".to_string(),
        }
    }
}

/// What the run recorded about the child. The supervisor's own success is
/// independent of the child's exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_status: i32,
    pub signal: Option<String>,
}

pub struct Supervisor {
    config: RunConfig,
    classifier: Box<dyn OutputClassifier>,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Self {
        Self::with_classifier(config, Box::new(HeuristicClassifier::new()))
    }

    pub fn with_classifier(config: RunConfig, classifier: Box<dyn OutputClassifier>) -> Self {
        Self { config, classifier }
    }

    /// Drive the command from spawn to reaped.
    ///
    /// # Errors
    ///
    /// Setup failures (record writes before spawn, a preexisting output
    /// log, PTY or fork errors) return early and never mark the record
    /// completed. After a successful spawn, metadata write failures are
    /// logged, the record is still finalized, and the first failure is
    /// returned at the end.
    pub fn run(self) -> Result<RunOutcome> {
        let config = self.config;
        let dir = ProcessDir::new(&config.process_dir);

        dir.write_cmd(&config.argv).context("write cmd")?;
        dir.write_completed(false).context("write completed=false")?;
        dir.write_starttime(&Utc::now()).context("write starttime")?;

        let log = dir.create_output_log().map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                anyhow!(
                    "refusing to start: {} already exists",
                    dir.output_log_path().display()
                )
            } else {
                anyhow::Error::new(err).context("create output log")
            }
        })?;
        let (writer, writer_handle) = LogWriter::spawn(log);

        let SpawnedChild {
            master,
            stderr,
            pid,
        } = pty::spawn_supervised(&config.argv, dir.root(), &config.term)?;
        if let Err(err) = pty::set_winsize(master.as_raw_fd(), WINDOW_ROWS, WINDOW_COLS) {
            warn!(error = %err, "window size ioctl failed");
        }

        let stdout_source = master.try_clone().context("dup PTY master for capture")?;
        let (tap_tx, tap_rx) = bounded(QUEUE_CAPACITY);
        let stdout_flusher = Flusher::spawn(
            stdout_source,
            STREAM_STDOUT,
            writer.clone(),
            Some(tap_tx),
            config.idle_flush,
        )
        .context("start stdout flusher")?;
        let stderr_flusher = Flusher::spawn(
            stderr,
            STREAM_STDERR,
            writer.clone(),
            None,
            config.idle_flush,
        )
        .context("start stderr flusher")?;
        let classifier_thread = spawn_classifier(tap_rx, self.classifier, dir.clone());

        // The pid must be on disk before the intake starts accepting.
        dir.write_pid(pid).context("write pid")?;
        dir.write_status_running().context("write status")?;

        let intake = match &config.stdin_socket {
            Some(path) => Some(
                ControlSocket::spawn(path, master, pid, writer.clone())
                    .context("start control socket intake")?,
            ),
            None => {
                drop(master);
                None
            }
        };

        info!(pid, cmd = %config.argv.join(" "), "child running");
        let status = pty::wait_child(pid);
        let delivered_signal = intake.and_then(ControlSocket::stop);

        let mut drained = true;
        for (stream, flusher) in [
            (STREAM_STDOUT, stdout_flusher),
            (STREAM_STDERR, stderr_flusher),
        ] {
            if !flusher.wait(FLUSHER_DONE_WAIT) {
                warn!(stream, "flusher did not signal completion in time");
                drained = false;
            }
        }

        drop(writer);
        let (stdout_prefix, drain_result) = if drained {
            let prefix = classifier_thread.join().unwrap_or_default();
            (prefix, writer_handle.wait())
        } else {
            // A wedged flusher still holds a producer handle; waiting on the
            // drain would inherit the wedge.
            (Vec::new(), Ok(()))
        };

        let (exit_code, termination_signal) = match status {
            Ok(ChildStatus::Exited(code)) => (code, None),
            Ok(ChildStatus::Signaled(signo)) => (128 + signo, Some(signo)),
            Err(err) => {
                warn!(error = %err, "waitpid failed");
                (1, None)
            }
        };
        let signal = termination_signal
            .or(delivered_signal)
            .map(signal_description);

        let mut deferred: Option<anyhow::Error> = None;
        record_failure(&mut deferred, "exit-status", dir.write_exit_status(exit_code));
        if let Some(description) = &signal {
            record_failure(&mut deferred, "signal", dir.write_signal(description));
        }
        record_failure(&mut deferred, "endtime", dir.write_endtime(&Utc::now()));
        record_failure(
            &mut deferred,
            "content-type",
            dir.write_content_type(detect_content_type(&stdout_prefix)),
        );
        record_failure(&mut deferred, "status", dir.remove_status());
        if let Err(err) = drain_result {
            warn!(error = %err, "output log drain failed");
            if deferred.is_none() {
                deferred = Some(anyhow::Error::new(err).context("drain output log"));
            }
        }
        record_failure(&mut deferred, "completed", dir.write_completed(true));

        info!(pid, exit_code, signal = signal.as_deref(), "child reaped, record finalized");
        match deferred {
            None => Ok(RunOutcome {
                exit_status: exit_code,
                signal,
            }),
            Some(err) => Err(err),
        }
    }
}

fn record_failure(deferred: &mut Option<anyhow::Error>, file: &str, result: io::Result<()>) {
    if let Err(err) = result {
        warn!(file, error = %err, "record write failed");
        if deferred.is_none() {
            *deferred = Some(anyhow::Error::new(err).context(format!("write {file}")));
        }
    }
}
