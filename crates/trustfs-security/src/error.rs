//! Error types for the security subsystem.

use thiserror::Error;
use trustfs_dispatch::DispatchError;

/// Result type alias for security operations.
pub type Result<T> = std::result::Result<T, SecurityError>;

/// Errors returned by key, ticket and crypto operations.
///
/// `Expired` and `AuthDecryptFailure` are authentication failures and must
/// not be retried. `InsufficientBuffer` is always recoverable by retrying
/// with a buffer of `needed` bytes.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Bad size, buffer, enum value or option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing key, ticket or option.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ticket outside its validity or renewal window.
    #[error("expired: {0}")]
    Expired(String),

    /// Authentication tag mismatch or corrupted ciphertext.
    #[error("authentication failed while decrypting")]
    AuthDecryptFailure,

    /// Caller-supplied output buffer is too small.
    #[error("insufficient buffer: need {needed} bytes, have {available}")]
    InsufficientBuffer {
        /// Bytes required.
        needed: usize,
        /// Bytes supplied.
        available: usize,
    },

    /// Ciphertext references a key type that is unknown or not configured.
    #[error("unknown key type {0}")]
    UnknownKeyType(u32),

    /// Compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression failed or produced an unexpected length.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Encoding or decoding a ticket, key record or file line failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatcher refused the work.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl SecurityError {
    /// Errno-style code for callers that report numeric status.
    pub fn errno(&self) -> i32 {
        match self {
            SecurityError::InvalidArgument(_) | SecurityError::Serialization(_) => libc::EINVAL,
            SecurityError::NotFound(_) => libc::ENOENT,
            SecurityError::Expired(_) => libc::EKEYEXPIRED,
            SecurityError::AuthDecryptFailure => libc::EBADMSG,
            SecurityError::InsufficientBuffer { .. } => libc::ENOSPC,
            SecurityError::UnknownKeyType(_) => libc::ENOKEY,
            SecurityError::CompressionFailed(_) | SecurityError::DecompressionFailed(_) => {
                libc::EIO
            }
            SecurityError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            SecurityError::Dispatch(_) => libc::ESHUTDOWN,
        }
    }

    /// True for failures that mean "do not trust this credential".
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SecurityError::Expired(_) | SecurityError::AuthDecryptFailure
        )
    }
}

impl From<bincode::Error> for SecurityError {
    fn from(e: bincode::Error) -> Self {
        SecurityError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for SecurityError {
    fn from(e: base64::DecodeError) -> Self {
        SecurityError::Serialization(e.to_string())
    }
}
