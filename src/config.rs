//! CLI schema for the supervisor binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mshell",
    about = "Run a command under supervision with a multiplexed output log",
    version
)]
pub struct Cli {
    /// Write diagnostic traces to the local trace log
    #[arg(long = "logs", env = "MSHELL_LOGS", default_value_t = false)]
    pub logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch a command detached from the caller and capture its output
    Nohup {
        /// Unix socket path accepting framed stdin/signal records
        #[arg(long = "stdin-socket")]
        stdin_socket: Option<PathBuf>,

        /// Idle interval before a partial output line is flushed (ms)
        #[arg(long = "idle-flush-ms", default_value_t = 100)]
        idle_flush_ms: u64,

        /// Command to run; the executable's directory becomes the process
        /// directory
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

/// The process directory is the directory containing the executable.
/// A bare command name has no containing directory and is refused.
pub fn process_dir_for(executable: &str) -> Result<PathBuf> {
    let parent = Path::new(executable)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .with_context(|| format!("command path {executable:?} has no containing directory"))?;
    if parent == Path::new(".") {
        bail!("command path {executable:?} has no containing directory");
    }
    Ok(parent.to_path_buf())
}
