//! Error types for the dispatch subsystem.

use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors reported by the dispatcher itself.
///
/// These never describe the outcome of the scheduled work; that travels to the
/// work's callback as a [`WorkError`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Lane index outside the fixed lane table.
    #[error("invalid lane index {0}")]
    InvalidLane(usize),

    /// The dispatcher has been shut down and no longer accepts work.
    #[error("dispatcher is shut down")]
    ShutDown,

    /// Spawning a worker thread failed.
    #[error("failed to spawn worker for lane {lane}: {source}")]
    Spawn {
        /// Lane the worker was meant to serve.
        lane: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Error code carried by a work item to its callback.
///
/// The dispatcher only transports this value; interpreting or retrying is up to
/// the callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    /// Errno-style failure code set by the enqueuer or a previous stage.
    #[error("work failed with code {0}")]
    Code(i32),

    /// Failure described by a message.
    #[error("work failed: {0}")]
    Failed(String),
}
