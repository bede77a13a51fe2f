//! Request identity, state, and completion records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// How many same-microsecond allocations the suffix field can absorb before
/// the stamp bleeds into the next microsecond.
const SEQ_SPAN: u64 = 1_000;

/// Last issued stamp, packed as `micros * SEQ_SPAN + seq`.
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a request.
///
/// Ids are strictly increasing in allocation order: the microsecond stamp
/// carries a disambiguating suffix, and a process-wide atomic guarantees two
/// allocations within the same clock tick still order correctly; collisions
/// are resolved by construction, never by retry. Fields are fixed-width and
/// zero-padded so that lexicographic order equals allocation order, which is
/// what the spool's directory listings rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Allocate a fresh id, greater than every id this process issued before.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
            * SEQ_SPAN;
        let prev = LAST_STAMP
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .expect("stamp update closure always returns Some");
        let stamp = if now > prev { now } else { prev + 1 };

        Self(format!(
            "{:016}-{:03}-{:05}",
            stamp / SEQ_SPAN,
            stamp % SEQ_SPAN,
            std::process::id()
        ))
    }

    /// The id as the string form used for spool entry names.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The exclusive spool state of a request.
///
/// A request occupies exactly one of these states at a time. The abort flag
/// is an overlay marker kept in its own container and is deliberately not a
/// member of this enum: it may be present alongside any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Enqueued by a client, not yet seen by the server.
    Requested,
    /// Discovered by the server, waiting for capacity.
    Pending,
    /// Handed to the task manager.
    Running,
    /// Finished; a completion record is stored for the client to consume.
    Complete,
}

impl RequestState {
    /// All exclusive states, in lifecycle order.
    pub const ALL: [RequestState; 4] = [
        RequestState::Requested,
        RequestState::Pending,
        RequestState::Running,
        RequestState::Complete,
    ];

    /// Name of the spool container directory for this state.
    pub fn dir_name(self) -> &'static str {
        match self {
            RequestState::Requested => "requested",
            RequestState::Pending => "pending",
            RequestState::Running => "running",
            RequestState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Persisted `(result, is_error)` pair for a finished request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// The task's result value, or its error description when `is_error`.
    pub result: serde_json::Value,
    /// Whether `result` carries an error description instead of a value.
    pub is_error: bool,
}

impl Completion {
    /// Record a successful result.
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result,
            is_error: false,
        }
    }

    /// Record a task failure, preserving its description.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }

    /// Recover the stored outcome, re-raising a stored error as
    /// [`QueueError::TaskFailed`] with the original description.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if self.is_error {
            let message = match self.result {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Err(QueueError::TaskFailed(message))
        } else {
            Ok(self.result)
        }
    }
}
