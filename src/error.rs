//! Engine-wide error types.
//!
//! Every recoverable failure mode has its own discriminant so callers can
//! branch without string matching. Recoverable errors are returned without
//! side effects beyond those already durable; `Corruption` is fatal to the
//! operation that hit it and is never retried.

use std::io;

use thiserror::Error;

use crate::common::TransactionId;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Error type covering all engine subsystems.
#[derive(Debug, Error)]
pub enum DbError {
    /// Document or collection absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Document ID collision or unique-index violation. A unique-index
    /// violation carries the offending key rendering.
    #[error("already exists: {what}{}", .key.as_deref().map(|k| format!(" (key {k})")).unwrap_or_default())]
    AlreadyExists { what: String, key: Option<String> },

    /// Empty names, malformed field paths, unsupported coercions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic-version or cross-thread update collision on a document.
    #[error("write conflict on {collection}/{id}: {detail}")]
    Conflict {
        collection: String,
        id: String,
        detail: String,
    },

    /// The transaction was chosen as a deadlock victim.
    #[error("deadlock detected: transaction {victim} aborted over '{resource}'")]
    DeadlockDetected {
        victim: TransactionId,
        resource: String,
    },

    /// Lock wait or transaction lifetime exceeded its limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation on a transaction that is not in a state accepting it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Field type mismatch or malformed operation sequence in an atomic
    /// document operator.
    #[error("atomic update failed on {collection}/{id} at '{path}' ({op}): {detail}")]
    AtomicUpdate {
        collection: String,
        id: String,
        path: String,
        op: String,
        detail: String,
    },

    /// CRC mismatch or malformed framing during log replay. Fatal.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DbError {
    pub fn not_found(what: impl Into<String>) -> Self {
        DbError::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        DbError::AlreadyExists {
            what: what.into(),
            key: None,
        }
    }

    /// Unique-index violation carrying the duplicate key.
    pub fn duplicate_key(index: impl Into<String>, key: impl Into<String>) -> Self {
        DbError::AlreadyExists {
            what: index.into(),
            key: Some(key.into()),
        }
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        DbError::InvalidArgument(detail.into())
    }

    pub fn conflict(
        collection: impl Into<String>,
        id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        DbError::Conflict {
            collection: collection.into(),
            id: id.into(),
            detail: detail.into(),
        }
    }

    pub fn atomic_update(
        collection: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
        op: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        DbError::AtomicUpdate {
            collection: collection.into(),
            id: id.into(),
            path: path.into(),
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn illegal_state(detail: impl Into<String>) -> Self {
        DbError::IllegalState(detail.into())
    }

    pub fn corruption(detail: impl Into<String>) -> Self {
        DbError::Corruption(detail.into())
    }

    /// True when retrying the whole transaction may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DbError::DeadlockDetected { .. } | DbError::Timeout(_) | DbError::Conflict { .. }
        )
    }

    /// True for failures that must stop the current run entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Corruption(_))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corruption(format!("malformed document payload: {err}"))
    }
}
