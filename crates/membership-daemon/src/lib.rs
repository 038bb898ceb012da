//! membership-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to drive the daemon without stdio.

pub mod daemon;
pub mod message;

pub use daemon::{Daemon, DaemonChannels};
pub use message::{InputError, InputLine, LineReader, MAX_LINE_SIZE, OutputLine, RawLine};
