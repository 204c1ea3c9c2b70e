//! # Error Handling for BulkWrite
//!
//! This module defines the error types used throughout the crate. A single
//! error enum ([`Error`]) represents all failure modes, which keeps function
//! signatures simple and lets callers handle failures uniformly.
//!
//! ## Error Categories
//!
//! | Category | Variants | Surfaces |
//! |----------|----------|----------|
//! | Validation | `Validation` | Synchronously, at the enqueue site |
//! | Usage | `AlreadyCommitted`, `DuplicateDocument`, `Closed` | Synchronously |
//! | Per-operation | `Operation` | Through the operation's result future |
//! | Transport | `Rpc` | Every operation in the affected batch |
//!
//! Validation and usage errors never enter a batch: the write is rejected
//! before it is enqueued. Everything else is delivered asynchronously through
//! the per-operation result future.
//!
//! The enum derives `Clone` because a transport-level failure is fanned out
//! to every operation in the batch.

use thiserror::Error;

// =============================================================================
// Status Codes
// =============================================================================

/// Canonical RPC status codes, as reported by the backend per write.
///
/// The bulk RPC returns one status per write; [`StatusCode::Ok`] means the
/// write applied, anything else is surfaced through that operation's result
/// future as [`Error::Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Returns true for the success status.
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// The canonical upper-case name of this code.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur while scheduling and committing writes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Validation Errors (rejected before entering a batch)
    // =========================================================================

    /// Malformed user input: non-map data, conflicting field paths,
    /// disallowed sentinel placement, conflicting merge options, or a
    /// disallowed precondition.
    #[error("invalid argument: {0}")]
    Validation(String),

    // =========================================================================
    // Usage Errors (caller misused the surface)
    // =========================================================================

    /// The batch was already committed (or is full and sealed); no further
    /// operations may be appended.
    #[error("cannot modify a batch that has already been committed")]
    AlreadyCommitted,

    /// The batch already contains a write for this document.
    ///
    /// A batch holds at most one write per document path; the scheduler
    /// routes a second write to the same document into a fresh batch.
    #[error("batch already contains a write for document '{path}'")]
    DuplicateDocument {
        /// The document path that was enqueued twice.
        path: String,
    },

    /// The writer has been closed; no further writes or flushes are accepted.
    #[error("the writer has already been closed")]
    Closed,

    // =========================================================================
    // Asynchronous Errors (delivered through result futures)
    // =========================================================================

    /// A single write failed at the backend while others in the same batch
    /// may have succeeded.
    #[error("write failed with status {code}: {message}")]
    Operation {
        /// The per-write status code reported by the backend.
        code: StatusCode,
        /// The per-write status message reported by the backend.
        message: String,
    },

    /// The RPC itself failed. In bulk mode every operation in the affected
    /// batch observes this error; in commit mode the whole commit fails.
    #[error("rpc failed with status {code}: {message}")]
    Rpc {
        /// The RPC-level status code.
        code: StatusCode,
        /// The RPC-level status message.
        message: String,
    },

    /// The result channel was dropped before a result was delivered.
    ///
    /// Surfaces to a caller still awaiting a result future when the writer
    /// or coordinator owning the operation is dropped before the operation
    /// was ever sent. A result future never hangs: the operation resolves,
    /// is terminally rejected, or its owner's drop ends the wait with this
    /// error.
    #[error("result channel dropped before a result was delivered")]
    ResultDropped,
}

impl Error {
    /// Builds a validation error from anything displayable.
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Builds an RPC-level error.
    pub fn rpc(code: StatusCode, message: impl Into<String>) -> Self {
        Error::Rpc {
            code,
            message: message.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let duplicate = Error::DuplicateDocument {
            path: "projects/p/databases/d/documents/c/doc".to_string(),
        };
        assert_eq!(
            duplicate.to_string(),
            "batch already contains a write for document \
             'projects/p/databases/d/documents/c/doc'"
        );

        let operation = Error::Operation {
            code: StatusCode::Unavailable,
            message: "backend unavailable".to_string(),
        };
        assert_eq!(
            operation.to_string(),
            "write failed with status UNAVAILABLE: backend unavailable"
        );

        let closed = Error::Closed;
        assert_eq!(closed.to_string(), "the writer has already been closed");
    }

    #[test]
    fn status_code_names() {
        assert!(StatusCode::Ok.is_ok());
        assert!(!StatusCode::Aborted.is_ok());
        assert_eq!(StatusCode::FailedPrecondition.name(), "FAILED_PRECONDITION");
        assert_eq!(format!("{}", StatusCode::NotFound), "NOT_FOUND");
    }
}
