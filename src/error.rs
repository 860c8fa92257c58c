//! Error types for tillwatch

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// An audit event could not be durably recorded.
    ///
    /// Never fatal to the business operation that produced the event —
    /// callers recover locally and surface the failure to observability.
    #[error("Failed to record audit event: {0}")]
    Ingestion(String),

    /// Read path failed. Propagated to the caller with no partial or
    /// stale data returned in its place.
    #[error("Audit query failed: {0}")]
    Query(String),

    /// A single rule's evaluation failed. Isolated per rule so one bad
    /// rule never aborts the evaluation of others.
    #[error("Evaluation of rule '{rule_id}' failed: {reason}")]
    RuleEvaluation {
        rule_id: String,
        reason: String,
    },

    /// A notification channel failed to deliver. The alert remains valid
    /// regardless of delivery outcome.
    #[error("Notification via '{channel}' failed: {reason}")]
    NotificationDispatch {
        channel: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Alert, rule, or event not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration or rule validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store call exceeded its caller-supplied timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Caller lacks the administrator capability
    #[error("Access denied: {0}")]
    AccessDenied(String),
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
