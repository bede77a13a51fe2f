//! Client for enqueueing requests and retrieving their results.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{QueueError, Result};
use crate::request::{Completion, RequestId, RequestState};
use crate::spool::Spool;

/// Per-state entry counts, as observed in one pass over the spool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests enqueued but not yet discovered by the server.
    pub requested: usize,
    /// Requests discovered, waiting for capacity.
    pub pending: usize,
    /// Requests currently executing.
    pub running: usize,
    /// Requests with an unconsumed completion record.
    pub complete: usize,
    /// Requests flagged for teardown.
    pub aborting: usize,
}

/// Client handle for producers of work.
///
/// The client never talks to the server directly: enqueueing drops an entry
/// into the spool, aborting sets a marker, and waiting polls for the
/// completion the server eventually publishes.
#[derive(Debug, Clone)]
pub struct WorkQueueClient {
    spool: Spool,
    config: ClientConfig,
}

impl WorkQueueClient {
    /// Create a client over an existing spool with default configuration.
    pub fn new(spool: Spool) -> Self {
        Self::with_config(spool, ClientConfig::default())
    }

    /// Create a client with a specific configuration.
    pub fn with_config(spool: Spool, config: ClientConfig) -> Self {
        Self { spool, config }
    }

    /// Enqueue a unit of work; returns its freshly allocated id.
    ///
    /// Never blocks on the server.
    pub async fn enqueue<T: Serialize>(&self, payload: &T) -> Result<RequestId> {
        let id = RequestId::generate();
        let value = serde_json::to_value(payload)?;
        self.spool.put(RequestState::Requested, &id, &value).await?;

        tracing::debug!(request_id = %id, "Request enqueued");
        Ok(id)
    }

    /// Request teardown of `id` regardless of its current state.
    ///
    /// Fire-and-forget: returns once the marker is set, without waiting for
    /// the server to acknowledge. Safe to call repeatedly, or on a request
    /// that already completed or was already aborted.
    pub async fn abort(&self, id: &RequestId) -> Result<()> {
        self.spool.set_abort_marker(id).await?;
        tracing::debug!(request_id = %id, "Abort requested");
        Ok(())
    }

    /// Wait for the result of `id`, consuming its completion entry.
    ///
    /// Returns the stored result, re-raises a stored task error as
    /// [`QueueError::TaskFailed`] with the original description, or fails
    /// with [`QueueError::Timeout`] once `timeout` elapses. On timeout an
    /// abort marker is left behind so the server eventually reclaims the
    /// request. A zero timeout does not block past the first failed poll.
    pub async fn wait<R: DeserializeOwned>(&self, id: &RequestId, timeout: Duration) -> Result<R> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.spool.take(RequestState::Complete, id).await {
                Ok(value) => {
                    let completion: Completion = serde_json::from_value(value)?;
                    let result = completion.into_result()?;
                    tracing::debug!(request_id = %id, "Result consumed");
                    return Ok(serde_json::from_value(result)?);
                }
                Err(QueueError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                self.spool.set_abort_marker(id).await?;
                tracing::debug!(request_id = %id, "Wait timed out, abort requested");
                return Err(QueueError::Timeout(id.clone()));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Snapshot of per-state entry counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            requested: self.count(RequestState::Requested).await?,
            pending: self.count(RequestState::Pending).await?,
            running: self.count(RequestState::Running).await?,
            complete: self.count(RequestState::Complete).await?,
            aborting: self.spool.list_abort_markers().await?.len(),
        })
    }

    async fn count(&self, state: RequestState) -> Result<usize> {
        Ok(self.spool.list_request_ids(state).await?.len())
    }
}
