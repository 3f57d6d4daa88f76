//! Firestore mock error types
//!
//! Unified error hierarchy for the storage engine and query evaluator.
//! Mirrors the Firestore server's status codes so callers can pattern-match
//! the same way they would against a real backend response.

use thiserror::Error;

/// Errors raised by the storage engine, commit pipeline, transaction
/// manager, and query evaluator.
///
/// Every variant corresponds to one of the error kinds in the design: a
/// short status code plus a descriptive message. Historical read-window
/// exhaustion is deliberately *not* a variant here — it surfaces as a
/// non-existent document, never as an error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FirestoreError {
    /// Malformed request, unsupported feature, failed validation, or a
    /// missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A precondition of `exists=true` failed, or a referenced transaction
    /// is unknown to the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition of `exists=false` failed.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A `last_update_time` precondition did not match exactly.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A transactional snapshot conflict, or an attempt to act on a
    /// transaction that has already completed.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An explicitly unsupported path, such as an unimplemented query
    /// modifier.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unexpected invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation attempted on a closed controller.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl FirestoreError {
    /// Short status code, suitable for assertions in tests and for
    /// populating a `WriteResult::status` entry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::FailedPrecondition(_) => "FailedPrecondition",
            Self::Aborted(_) => "Aborted",
            Self::Unimplemented(_) => "Unimplemented",
            Self::Internal(_) => "Internal",
            Self::Unavailable(_) => "Unavailable",
        }
    }

    /// Whether this error reflects a transactional conflict that a caller
    /// might reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Unavailable(_))
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, FirestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_variant() {
        assert_eq!(FirestoreError::NotFound("x".into()).code(), "NotFound");
        assert_eq!(
            FirestoreError::AlreadyExists("x".into()).code(),
            "AlreadyExists"
        );
        assert_eq!(FirestoreError::Aborted("x".into()).code(), "Aborted");
    }

    #[test]
    fn retryable_classification() {
        assert!(FirestoreError::Aborted("x".into()).is_retryable());
        assert!(FirestoreError::Unavailable("x".into()).is_retryable());
        assert!(!FirestoreError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn display_contains_message() {
        let err = FirestoreError::InvalidArgument("bad path".into());
        assert!(format!("{err}").contains("bad path"));
    }
}
