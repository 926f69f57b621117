//! Supervised process runner: PTY capture, framed output logging, and a
//! control socket for stdin and signal relay.

pub mod chunk;
pub mod classify;
pub mod codec;
pub mod config;
pub mod flusher;
pub mod intake;
pub mod procdir;
pub mod pty;
pub mod signals;
pub mod sniff;
pub mod supervisor;
pub mod telemetry;

pub use chunk::Chunk;
pub use supervisor::{RunConfig, RunOutcome, Supervisor};
