//! Error types for platen-core.

use thiserror::Error;

/// Result type for platen-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in platen-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Pipeline construction failed; the pipeline never became usable.
    #[error("construction failed: {0}")]
    Construction(String),

    /// An in-flight conversion failed. The executor survives; the next
    /// queued item still runs.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The request was cancelled before or during execution.
    #[error("conversion cancelled")]
    Cancelled,

    /// Submission after the pipeline was disposed or aborted.
    #[error("pipeline closed")]
    Closed,

    /// IPC communication error with the worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Failed to load the engine's shared library.
    #[error("failed to load engine library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Serialization error on the IPC channel.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invocation from the pipeline's own thread while the engine instance
    /// is mid-operation. The engine is non-reentrant; queuing from inside a
    /// conversion and waiting on it would deadlock.
    #[error("reentrant invocation on the conversion thread")]
    Reentrant,
}
