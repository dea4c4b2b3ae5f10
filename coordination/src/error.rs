//! Top-level error type composing every subsystem's errors.

use thiserror::Error;

use crate::lock::LockError;
use crate::manifest::ManifestError;
use crate::migration::MigrationError;
use crate::process::ProcessError;

/// Aggregate error type for callers that drive the whole pipeline
/// (manifest load through lock release) and want one `Result` to propagate
/// with `anyhow::Context`.
#[derive(Debug, Error)]
pub enum DisnixError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
