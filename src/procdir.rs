//! On-disk process record: one directory per supervised command.
//!
//! The directory is the single source of truth for a run. A reader that
//! observes `completed=true` may take every other file as final; a record
//! still reading `completed=false` after the supervisor's lifetime marks a
//! crash and its files are indeterminate.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::chunk::format_timestamp;
use crate::classify::OutputKind;

/// Separator between argv elements inside the `cmd` file. The joined form
/// is preserved verbatim for consumers; reversing it is only exact when no
/// argument contains the separator byte itself.
pub const CMD_ARG_SEPARATOR: u8 = 0x08;

pub const OUTPUT_LOG_FILE: &str = "output.log";

/// Handle on a process directory. Creation of the directory itself is the
/// caller's job; the supervisor only writes files inside it.
#[derive(Debug, Clone)]
pub struct ProcessDir {
    root: PathBuf,
}

impl ProcessDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_log_path(&self) -> PathBuf {
        self.root.join(OUTPUT_LOG_FILE)
    }

    /// Create the output log for appending with synchronous writes.
    /// Fails with `AlreadyExists` if a log is already present.
    pub fn create_output_log(&self) -> io::Result<File> {
        OpenOptions::new()
            .append(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_SYNC)
            .open(self.output_log_path())
    }

    pub fn write_cmd(&self, argv: &[String]) -> io::Result<()> {
        let joined = argv
            .iter()
            .map(|a| a.as_bytes().to_vec())
            .collect::<Vec<_>>()
            .join(&CMD_ARG_SEPARATOR);
        self.write_file("cmd", &joined)
    }

    /// Reverse the `cmd` joining; exact as long as no argument contained
    /// the separator byte.
    pub fn read_cmd(&self) -> io::Result<Vec<String>> {
        let bytes = std::fs::read(self.root.join("cmd"))?;
        Ok(bytes
            .split(|&b| b == CMD_ARG_SEPARATOR)
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect())
    }

    pub fn write_starttime(&self, ts: &DateTime<Utc>) -> io::Result<()> {
        self.write_file("starttime", format_timestamp(ts).as_bytes())
    }

    pub fn write_endtime(&self, ts: &DateTime<Utc>) -> io::Result<()> {
        self.write_file("endtime", format_timestamp(ts).as_bytes())
    }

    pub fn write_pid(&self, pid: i32) -> io::Result<()> {
        self.write_file("pid", pid.to_string().as_bytes())
    }

    pub fn write_status_running(&self) -> io::Result<()> {
        self.write_file("status", b"running")
    }

    /// `status` is `running` or absent; absent once the run is over.
    pub fn remove_status(&self) -> io::Result<()> {
        match std::fs::remove_file(self.root.join("status")) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn write_completed(&self, completed: bool) -> io::Result<()> {
        let value: &[u8] = if completed { b"true" } else { b"false" };
        self.write_file("completed", value)
    }

    pub fn write_exit_status(&self, code: i32) -> io::Result<()> {
        self.write_file("exit-status", code.to_string().as_bytes())
    }

    pub fn write_signal(&self, description: &str) -> io::Result<()> {
        self.write_file("signal", description.as_bytes())
    }

    pub fn write_output_type(&self, kind: OutputKind, reason: &str) -> io::Result<()> {
        self.write_file(
            "output-type",
            format!("{},{}", kind.as_str(), reason).as_bytes(),
        )
    }

    pub fn write_content_type(&self, mime: &str) -> io::Result<()> {
        self.write_file("content-type", mime.as_bytes())
    }

    /// Read one metadata file as text; used by record consumers and tests.
    pub fn read(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(self.root.join(name))?;
        file.write_all(contents)?;
        file.flush()
    }
}
