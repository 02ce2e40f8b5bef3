//! Error types for bamkit
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error
//! side is one of the categories of [`BamError`]. Plain I/O failures keep
//! their `std::io::Error`; structural problems with the container are
//! reported as [`BamError::CorruptBlock`] so callers can tell a broken file
//! apart from a missing one.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for bamkit operations
pub type Result<T> = std::result::Result<T, BamError>;

/// Error types that can occur in bamkit
#[derive(Debug, Error)]
pub enum BamError {
    /// File could not be opened as a BAM container (missing file, bad magic,
    /// truncated header)
    #[error("Cannot open {path}: {reason}")]
    OpenFailed {
        /// Path that failed to open
        path: PathBuf,
        /// Human-readable cause
        reason: String,
    },

    /// Decompression or structural failure in the middle of a stream
    #[error("Corrupt block: {0}")]
    CorruptBlock(String),

    /// Region query against a reference name absent from the header
    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    /// Writer (or reader) call made in the wrong state
    #[error("Protocol violation: {operation} is not allowed in state {state}")]
    ProtocolViolation {
        /// Operation that was attempted
        operation: &'static str,
        /// State the component was in
        state: &'static str,
    },

    /// Tag accessed with a getter for a different value type
    #[error("Type mismatch for tag {tag}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Two-character tag key
        tag: String,
        /// Requested value type
        expected: &'static str,
        /// Actual value type (or "null" when absent)
        found: &'static str,
    },

    /// Malformed value supplied to a setter or encoder
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// Worker task panicked, or the pool was used after shutdown
    #[error("Worker pool error: {0}")]
    Worker(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl BamError {
    /// Short name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            BamError::OpenFailed { .. } => "OpenFailed",
            BamError::CorruptBlock(_) => "CorruptBlock",
            BamError::UnknownReference(_) => "UnknownReference",
            BamError::ProtocolViolation { .. } => "ProtocolViolation",
            BamError::TypeMismatch { .. } => "TypeMismatch",
            BamError::OutOfRange(_) => "OutOfRange",
            BamError::Worker(_) => "Worker",
            BamError::Io(_) => "Io",
        }
    }

    /// Wrap this error in an `io::Error` so it can cross a `std::io::Read`
    /// boundary and be recovered intact by `From<io::Error>`.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            BamError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<io::Error> for BamError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<BamError>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|inner| inner.downcast::<BamError>()) {
                return *inner;
            }
            return BamError::CorruptBlock("unrecoverable wrapped error".to_string());
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                BamError::CorruptBlock(format!("unexpected end of data: {}", err))
            }
            _ => BamError::Io(err),
        }
    }
}
