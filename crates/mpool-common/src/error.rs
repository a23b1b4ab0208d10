//! Error types for the mpool log engine
//!
//! One variant per failure kind the mlog and MDC engines report. Callers
//! branch on the kind (or on [`Error::errno`]) to decide the next action:
//! compact on [`Error::LogFull`], regrow the buffer on
//! [`Error::BufferTooSmall`], re-drive compaction on
//! [`Error::IncompleteCompaction`].

use thiserror::Error;

/// Common result type for mpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for mpool
#[derive(Debug, Error)]
pub enum Error {
    /// Contract violation by the caller (misaligned offset, log not open,
    /// open flag mismatch, marker out of order).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No live engine state for the object.
    #[error("not found: {0}")]
    NotFound(String),

    /// Append would exceed the log capacity.
    #[error("log full: requested {requested} bytes, available {available} bytes")]
    LogFull { requested: u64, available: u64 },

    /// CSTART without a matching CEND was found at open.
    #[error("incomplete compaction: {0}")]
    IncompleteCompaction(String),

    /// Conflicting state transition in progress.
    #[error("busy: {0}")]
    Busy(String),

    /// Log block framing or record chain validation failed.
    #[error("malformed log data: {0}")]
    MalformedData(String),

    /// Receive buffer is smaller than the next record.
    #[error("buffer too small: record needs {required} bytes")]
    BufferTooSmall { required: usize },

    /// Underlying media read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a malformed data error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedData(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create an I/O error from a message
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(msg.into()))
    }

    /// Check if this is a log full error
    #[must_use]
    pub const fn is_log_full(&self) -> bool {
        matches!(self, Self::LogFull { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error came from log framing rather than from the media.
    ///
    /// An MDC tolerates one half of its pair failing this way at open.
    #[must_use]
    pub const fn is_framing(&self) -> bool {
        matches!(self, Self::IncompleteCompaction(_) | Self::MalformedData(_))
    }

    /// Record length a retried read needs, for [`Error::BufferTooSmall`]
    #[must_use]
    pub const fn required_len(&self) -> Option<usize> {
        match self {
            Self::BufferTooSmall { required } => Some(*required),
            _ => None,
        }
    }

    /// Get the POSIX errno equivalent of this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::LogFull { .. } => libc::EFBIG,
            Self::IncompleteCompaction(_) => libc::EMSGSIZE,
            Self::Busy(_) => libc::EBUSY,
            Self::MalformedData(_) => libc::ENODATA,
            Self::BufferTooSmall { .. } => libc::EOVERFLOW,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
