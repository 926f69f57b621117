//! Supervisor CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use mshell::config::{process_dir_for, Cli, Command};
use mshell::supervisor::{RunConfig, Supervisor};
use mshell::telemetry;

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.logs);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mshell: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Nohup {
            stdin_socket,
            idle_flush_ms,
            command,
        } => {
            let process_dir = process_dir_for(&command[0])?;
            let mut config = RunConfig::new(command, process_dir);
            config.stdin_socket = stdin_socket;
            config.idle_flush = Duration::from_millis(idle_flush_ms);
            // The record carries the child's exit status; this process
            // reports only whether supervision itself succeeded.
            Supervisor::new(config).run()?;
            Ok(())
        }
    }
}
