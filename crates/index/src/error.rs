use config::ConfigError;
use ptable::PTableError;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::IndexState;

/// Errors raised by the table index.
///
/// Lookups never fail for a missing key; they return `None` or an empty
/// vector. These errors are for bad arguments and structural problems.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Table(#[from] PTableError),

    /// The index map or one of its tables cannot be trusted.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("{kind} checkpoint regression: {current} -> {attempted}")]
    CheckpointRegression {
        kind: &'static str,
        current: i64,
        attempted: i64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("table index is not ready (state: {0:?})")]
    NotReady(IndexState),

    /// A background failure stopped the index; writes are refused.
    #[error("table index is faulted: {0}")]
    Faulted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, IndexError>;
