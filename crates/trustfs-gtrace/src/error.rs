//! Error types for the trace logger.

use thiserror::Error;

/// Result type alias for trace logger operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by trace configuration and output operations.
///
/// Appending an entry never fails; these cover administrative calls only.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A size, mode or other argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No module with this name.
    #[error("unknown trace module: {0}")]
    UnknownModule(String),

    /// No level with this name.
    #[error("unknown trace level: {0}")]
    UnknownLevel(String),

    /// Writing to or rotating the log sink failed.
    #[error("trace sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Errno-style status code reported by the diagnostics surface.
    pub fn status_code(&self) -> i32 {
        match self {
            TraceError::InvalidArgument(_)
            | TraceError::UnknownModule(_)
            | TraceError::UnknownLevel(_) => EINVAL,
            TraceError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}

const EINVAL: i32 = 22;
const EIO: i32 = 5;
