#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Sideboot Exec
//!
//! External process execution for the sideboot boot orchestrator.
//!
//! - [`output`]: byte sinks that turn process output into lines, either
//!   buffered until asked for or streamed onto a bounded channel
//! - [`cmd`]: a runner owning one OS process in its own process group, with
//!   lock-guarded status snapshots and group-wide termination
//! - [`exec`]: run-to-completion helper used for the partition finder and the
//!   kexec stages

pub mod cmd;
pub mod exec;
pub mod output;

pub use cmd::{Cmd, CommandSpec, OutputMode, ProcessError, RunHandle, RunStatus, EXIT_UNSET};
pub use exec::Exec;
pub use output::{
    FanOut, LineStream, OutputBuffer, OutputError, OutputSink, DEFAULT_LINE_BUFFER_SIZE,
    DEFAULT_STREAM_CHAN_SIZE,
};
