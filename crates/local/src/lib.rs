//! Local in-process task manager for the spoolq work queue.
//!
//! Runs each admitted request as a spawned tokio task driving a
//! caller-supplied handler, with a fixed concurrency cap. This is the
//! simplest real execution backend: the server loop and the tasks share one
//! runtime, while the enqueueing client may live anywhere with access to the
//! same spool directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use spoolq_core::{Spool, ServerConfig, WorkQueueServer};
//! use spoolq_local::LocalTaskManager;
//!
//! let manager = LocalTaskManager::new(4, |_id, payload| async move {
//!     // ... do the work ...
//!     Ok(payload)
//! });
//! // server.process_requests(&manager).await
//! ```

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use spoolq_core::{RequestId, Result, TaskError, TaskManager, TaskResult};

/// Task manager that executes requests as local tokio tasks.
pub struct LocalTaskManager<F, Fut>
where
    F: Fn(RequestId, Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    handler: F,
    capacity: usize,
    tasks: Mutex<HashMap<RequestId, JoinHandle<TaskResult>>>,
}

impl<F, Fut> LocalTaskManager<F, Fut>
where
    F: Fn(RequestId, Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    /// Create a manager that runs at most `capacity` tasks at once.
    pub fn new(capacity: usize, handler: F) -> Self {
        Self {
            handler,
            capacity,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tasks currently held in the running set.
    pub async fn running_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl<F, Fut> TaskManager for LocalTaskManager<F, Fut>
where
    F: Fn(RequestId, Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn start_tick(&self) {}

    async fn has_capacity(&self) -> bool {
        self.tasks.lock().await.len() < self.capacity
    }

    async fn start_task(&self, id: &RequestId, payload: Value) -> Result<()> {
        let handle = tokio::spawn((self.handler)(id.clone(), payload));
        self.tasks.lock().await.insert(id.clone(), handle);
        tracing::debug!(request_id = %id, "Task spawned");
        Ok(())
    }

    async fn terminate_task(&self, id: &RequestId) -> Result<()> {
        if let Some(handle) = self.tasks.lock().await.remove(id) {
            handle.abort();
            tracing::debug!(request_id = %id, "Task terminated");
        }
        Ok(())
    }

    async fn reap(&self) -> Result<Vec<(RequestId, TaskResult)>> {
        let mut done = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            let finished: Vec<RequestId> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            for id in finished {
                if let Some(handle) = tasks.remove(&id) {
                    done.push((id, handle));
                }
            }
        }

        let mut results = Vec::new();
        for (id, handle) in done {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(TaskError::new(format!("task did not finish: {}", e))),
            };
            results.push((id, result));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}
