//! Process-iterator runtime (spec §4.3).
//!
//! Disnix's C implementation drives concurrency with a `fork`/`waitpid`
//! loop that reads completion notifications off a pipe one child at a
//! time (`libprocreact`). Rust's async runtime gives the same
//! producer/consumer shape without hand-rolled process-group bookkeeping:
//! a bounded worker pool of `tokio` tasks feeding a single completion
//! stream, exactly the pattern the teacher uses for sandboxed command
//! execution (`RunCommandTool`).

mod pool;

pub use pool::{spawn_bounded, Concurrency, JobQueue};

use thiserror::Error;

/// What a single activation/deactivation/query job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A job whose only signal is success/failure (activate, deactivate, lock).
    Status(bool),
    /// A job that streams back lines of text (query, print-invalid, collect-garbage).
    Lines(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("process exited with non-zero status: {0}")]
    NonZeroExit(i32),

    #[error("process exited due to signal")]
    Signaled,

    #[error("interrupted before completion")]
    Interrupted,

    #[error("output was not valid UTF-8")]
    InvalidOutput,
}
