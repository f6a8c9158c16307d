//! Error types for Itemvault Core
//!
//! Every fallible operation in the storage core returns [`StorageError`].
//! The variants fall into four families:
//!
//! - **Absence**: [`StorageError::ObjectNotFound`]. Callers decide whether a
//!   missing object is an error.
//! - **Persistency**: backend I/O failures, lock contention, malformed paths,
//!   reads of buffered deletes and unsupported operations.
//! - **Fan-out**: a write that reached no backend ([`StorageError::WriteFailed`])
//!   versus one that mutated some backends before failing
//!   ([`StorageError::PartiallyApplied`]).
//! - **Fatal**: [`StorageError::CommitAborted`], a commit that failed after
//!   earlier entries were already written. Never treat it as success.

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Main error type for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// No backend holds a value for the path
    #[error("Object not found: {item}/{path}")]
    ObjectNotFound { item: String, path: String },

    /// A backend reported a genuine I/O failure
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// The item is locked by another transaction
    #[error("Access denied: item {item} is locked by transaction {holder}")]
    AccessDenied { item: String, holder: String },

    /// Path could not be parsed into a cluster type and segments
    #[error("Invalid cluster path: {0}")]
    InvalidPath(String),

    /// The caller's own transaction deleted this path but has not committed
    #[error("Object {item}/{path} was deleted but not committed")]
    DeletedUncommitted { item: String, path: String },

    /// Operation not supported in the current mode or by any backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A fan-out write failed before any backend was mutated
    #[error("Write failed on backend '{backend}': {message}")]
    WriteFailed { backend: String, message: String },

    /// A fan-out write mutated some backends and then failed on another
    #[error("Write partially applied (written to {applied:?}, failed on '{failed}'): {message}")]
    PartiallyApplied {
        applied: Vec<String>,
        failed: String,
        message: String,
    },

    /// A commit failed after backends were already mutated
    #[error("Commit aborted after {applied} applied entries, {discarded} discarded: {source}")]
    CommitAborted {
        applied: usize,
        discarded: usize,
        source: Box<StorageError>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Shortcut for [`StorageError::ObjectNotFound`]
    pub fn not_found(item: impl ToString, path: impl ToString) -> Self {
        Self::ObjectNotFound {
            item: item.to_string(),
            path: path.to_string(),
        }
    }

    /// Shortcut for [`StorageError::Backend`]
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Shortcut for [`StorageError::InvalidPath`]
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Shortcut for [`StorageError::Unsupported`]
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with context layers stripped
    pub fn root(&self) -> &StorageError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the path simply has no value
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::ObjectNotFound { .. })
    }

    /// True when the item is locked by someone else
    pub fn is_access_denied(&self) -> bool {
        matches!(self.root(), Self::AccessDenied { .. })
    }

    /// True when backends may have been left mutated without the caller's
    /// intent being fully applied.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Self::CommitAborted { .. })
    }

    /// True when some, but not all, writes were applied
    pub fn is_partial(&self) -> bool {
        match self.root() {
            Self::PartiallyApplied { .. } => true,
            Self::CommitAborted { applied, source, .. } => *applied > 0 || source.is_partial(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
