//! Error types and result aliases for Tarn.
//!
//! The taxonomy is deliberately small and typed: callers dispatch on the
//! variant, never on message strings. `Conflict` is the only kind that is
//! always retriable; `Corrupt` is never retried and always surfaced.

use std::fmt;

/// The result type used throughout Tarn.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lake operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A named entity (pool, branch, object, commit, rule) is absent.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        kind: &'static str,
        /// The identifier or name that missed.
        id: String,
    },

    /// A unique-name or unique-id violation on insertion.
    #[error("{kind} already exists: {id}")]
    Exists {
        /// The kind of entity being inserted.
        kind: &'static str,
        /// The identifier or name that collided.
        id: String,
    },

    /// An optimistic-concurrency failure on a branch tip or journal head.
    ///
    /// Always retriable: the caller re-reads the current state and tries
    /// again under whatever retry policy it imposes.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A read from an empty journal, or a transaction with no actions.
    #[error("empty: {0}")]
    Empty(String),

    /// Malformed input: bad magic, unknown version, multi-key sort key,
    /// reserved name, and the like.
    #[error("invalid: {0}")]
    Invalid(String),

    /// On-disk content failed structural validation.
    ///
    /// Never retried.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// The caller cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Anything surfaced by the object-store adapter that is none of the
    /// above.
    #[error("storage: {message}")]
    Io {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a not-found error for the given entity kind and identifier.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Creates an already-exists error for the given entity kind and
    /// identifier.
    #[must_use]
    pub fn exists(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::Exists {
            kind,
            id: id.to_string(),
        }
    }

    /// Creates a retriable conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates an empty-read / empty-transaction error.
    #[must_use]
    pub fn empty(message: impl Into<String>) -> Self {
        Self::Empty(message.into())
    }

    /// Creates a malformed-input error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Creates a structural-validation error.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error with a source cause.
    #[must_use]
    pub fn io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for the retriable optimistic-concurrency failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if a named entity was absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for an empty journal read or empty transaction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty(_))
    }

    /// Returns true for a uniqueness violation.
    #[must_use]
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source(err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_predicates() {
        assert!(Error::conflict("tip moved").is_conflict());
        assert!(Error::not_found("pool", "logs").is_not_found());
        assert!(Error::empty("no entries").is_empty());
        assert!(Error::exists("pool", "logs").is_exists());
        assert!(!Error::corrupt("bad magic").is_conflict());
    }

    #[test]
    fn messages_carry_the_offending_identifier() {
        let err = Error::not_found("branch", "feature");
        assert_eq!(err.to_string(), "branch not found: feature");

        let err = Error::exists("pool", "logs");
        assert_eq!(err.to_string(), "pool already exists: logs");
    }

    #[test]
    fn io_error_converts_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io { source: Some(_), .. }));
    }
}
