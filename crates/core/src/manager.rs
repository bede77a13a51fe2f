//! Task-execution capability consumed by the scheduler.
//!
//! The core never runs tasks itself. Whatever actually executes work (a
//! process spawn, a thread pool, an RPC) sits behind the [`TaskManager`]
//! trait, and the scheduler relies only on this contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::RequestId;

/// Error reported by a task backend for a single finished task.
#[derive(Debug, Clone)]
pub struct TaskError {
    /// Description of the failure, delivered verbatim to the waiting client.
    pub message: String,
}

impl TaskError {
    /// Create a new task error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl<E: std::error::Error> From<E> for TaskError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// Outcome of one finished task.
pub type TaskResult = std::result::Result<serde_json::Value, TaskError>;

/// Execution backend driven by the work queue server.
///
/// Implementations must be thread-safe (Send + Sync). Concurrency of actual
/// task execution belongs entirely to the implementation; the scheduler
/// itself stays single-threaded and only consults this interface.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Called once per scheduling iteration before any admission or reaping
    /// decision, giving the backend a chance to advance internal time.
    async fn start_tick(&self);

    /// Admission gate: whether a new task may start right now.
    async fn has_capacity(&self) -> bool;

    /// Begin executing a task. Must not block the scheduler.
    async fn start_task(&self, id: &RequestId, payload: serde_json::Value) -> Result<()>;

    /// Best-effort cancellation of a running task.
    async fn terminate_task(&self, id: &RequestId) -> Result<()>;

    /// Collect tasks that have finished since the last call.
    ///
    /// Finished tasks are removed from the backend's running set as they
    /// are yielded; a task is reported at most once.
    async fn reap(&self) -> Result<Vec<(RequestId, TaskResult)>>;

    /// Suspension hook, invoked by the scheduler only on iterations with
    /// nothing actionable. Never runs in the same iteration as useful work,
    /// and is the scheduler's sole blocking point. Simulated-time backends
    /// may advance their clock here instead of sleeping.
    async fn idle_sleep(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}
