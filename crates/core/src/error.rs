//! Error types for the spoolq work queue library.

use thiserror::Error;

use crate::request::{RequestId, RequestState};

/// The main error type for the spoolq library.
#[derive(Error, Debug)]
pub enum QueueError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Spool storage error: the spool could not be read, written, or renamed.
    /// Fatal to the scheduler iteration that hits it.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// An entry for this request already exists in the target state.
    #[error("Duplicate request: {0}")]
    DuplicateRequest(RequestId),

    /// No entry for this request in the expected state.
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// A state transition lost its source entry, e.g. because the request
    /// was aborted concurrently. Callers treat this as "the request no
    /// longer exists in the expected state", not as a fatal error.
    #[error("Transition conflict for {id}: {from} -> {to}")]
    TransitionConflict {
        /// Request whose transition was attempted.
        id: RequestId,
        /// Expected source state.
        from: RequestState,
        /// Requested target state.
        to: RequestState,
    },

    /// The `wait` deadline elapsed before a completion appeared.
    #[error("Timed out waiting for request {0}")]
    Timeout(RequestId),

    /// The task behind a request failed; carries the original description.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
