//! Work queue server: the `process_requests` scheduler loop.
//!
//! The server is the sole writer of state-transition renames. Each iteration
//! drains abort markers before granting new capacity, so a request aborted
//! in the same window it would have started never starts. A running task may
//! still complete despite a concurrent abort when the backend finishes it
//! before the next abort-processing step; the stale result is discarded when
//! the marker is processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::{QueueError, Result};
use crate::manager::TaskManager;
use crate::request::{Completion, RequestId, RequestState};
use crate::spool::Spool;

/// Server half of the work queue: discovers spooled requests and drives a
/// [`TaskManager`] through their lifecycle.
pub struct WorkQueueServer {
    spool: Spool,
    config: ServerConfig,
    running: Arc<AtomicBool>,
}

impl WorkQueueServer {
    /// Create a server over an existing spool.
    ///
    /// Clearing `running` is the cancellation signal for
    /// [`WorkQueueServer::process_requests`]; the loop notices it at the top
    /// of its next iteration.
    pub fn new(spool: Spool, config: ServerConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            spool,
            config,
            running,
        }
    }

    /// Run the scheduler loop until the running flag is cleared.
    ///
    /// Per-request failures (a vanished entry, a failing task) are isolated
    /// to that request; only storage-layer failures escape this loop.
    pub async fn process_requests<M: TaskManager>(&self, manager: &M) -> Result<()> {
        tracing::info!(spool = %self.spool.root().display(), "Work queue server started");
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            if !self.tick(manager).await? {
                manager.idle_sleep(self.config.sample_interval).await;
            }
        }

        tracing::info!("Work queue server stopped");
        Ok(())
    }

    /// Run a single scheduler iteration; returns whether anything changed.
    ///
    /// [`WorkQueueServer::process_requests`] is this in a loop with the idle
    /// sleep; the single-step form exists for embedders and tests that drive
    /// the schedule themselves.
    pub async fn tick<M: TaskManager>(&self, manager: &M) -> Result<bool> {
        manager.start_tick().await;

        let mut progress = false;
        progress |= self.process_aborts(manager).await?;
        progress |= self.collect_new_requests().await?;
        progress |= self.start_pending_requests(manager).await?;
        progress |= self.complete_running_requests(manager).await?;
        Ok(progress)
    }

    /// Drain abort markers: tear down each marked request wherever it
    /// currently lives, then clear the marker.
    ///
    /// Runs before admission, so aborts always win the race against starts.
    /// A marker whose request already reached `complete/` discards the late
    /// result along with the entry.
    async fn process_aborts<M: TaskManager>(&self, manager: &M) -> Result<bool> {
        let marked = self.spool.list_abort_markers().await?;
        let mut progress = false;

        for id in marked {
            let state = self.spool.find_state(&id).await?;
            if let Some(state) = state {
                if state == RequestState::Running {
                    if let Err(e) = manager.terminate_task(&id).await {
                        tracing::warn!(request_id = %id, error = %e, "Failed to terminate task");
                    }
                }
                match self.spool.delete(state, &id).await {
                    Ok(()) => {}
                    // the entry can vanish between find and delete, e.g. a
                    // racing wait consumed the completion
                    Err(QueueError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.spool.clear_abort_marker(&id).await?;
            tracing::info!(request_id = %id, state = ?state, "Request aborted");
            progress = true;
        }
        Ok(progress)
    }

    /// Move freshly enqueued requests into the pending set.
    async fn collect_new_requests(&self) -> Result<bool> {
        let mut progress = false;
        for id in self.spool.list_request_ids(RequestState::Requested).await? {
            match self
                .spool
                .transition(&id, RequestState::Requested, RequestState::Pending)
                .await
            {
                Ok(()) => {
                    tracing::debug!(request_id = %id, "Request discovered");
                    progress = true;
                }
                Err(QueueError::TransitionConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(progress)
    }

    /// Admit pending requests, lowest id first, while capacity remains.
    async fn start_pending_requests<M: TaskManager>(&self, manager: &M) -> Result<bool> {
        let mut progress = false;
        for id in self.spool.list_request_ids(RequestState::Pending).await? {
            if !manager.has_capacity().await {
                break;
            }
            match self
                .spool
                .transition(&id, RequestState::Pending, RequestState::Running)
                .await
            {
                Ok(()) => {}
                Err(QueueError::TransitionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }

            let payload = self.spool.get(RequestState::Running, &id).await?;
            match manager.start_task(&id, payload).await {
                Ok(()) => {
                    tracing::debug!(request_id = %id, "Task started");
                }
                Err(e) => {
                    // the task never ran; surface the failure to the waiting
                    // client instead of crashing the loop
                    tracing::warn!(request_id = %id, error = %e, "Failed to start task");
                    self.write_completion(&id, Completion::failure(e.to_string()))
                        .await?;
                }
            }
            progress = true;
        }
        Ok(progress)
    }

    /// Reap finished tasks and publish their completions.
    ///
    /// A failing backend probe is logged and retried next tick; only spool
    /// failures escape.
    async fn complete_running_requests<M: TaskManager>(&self, manager: &M) -> Result<bool> {
        let finished = match manager.reap().await {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reap finished tasks");
                return Ok(false);
            }
        };

        let mut progress = false;
        for (id, result) in finished {
            // a terminated task can still surface here; only publish results
            // for requests that are still running
            match self.spool.find_state(&id).await? {
                Some(RequestState::Running) => {}
                state => {
                    tracing::debug!(
                        request_id = %id,
                        state = ?state,
                        "Dropping result for request no longer running"
                    );
                    continue;
                }
            }

            let completion = match result {
                Ok(value) => Completion::success(value),
                Err(err) => Completion::failure(err.message),
            };
            self.write_completion(&id, completion).await?;
            progress = true;
        }
        Ok(progress)
    }

    /// Publish a completion, then retire the running entry.
    async fn write_completion(&self, id: &RequestId, completion: Completion) -> Result<()> {
        let is_error = completion.is_error;
        let value = serde_json::to_value(&completion)?;
        // the completion lands before the running entry is dropped, so a
        // crash between the two cannot lose the result
        self.spool.put(RequestState::Complete, id, &value).await?;
        match self.spool.delete(RequestState::Running, id).await {
            Ok(()) => {}
            Err(QueueError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::debug!(request_id = %id, is_error, "Request completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkQueueClient;
    use crate::manager::{TaskError, TaskResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted task manager: a started task "runs" until the test queues a
    /// result for it with [`FakeManager::finish`].
    struct FakeManager {
        capacity: usize,
        inner: Mutex<FakeState>,
        /// When set, the first idle sleep clears this flag, stopping a
        /// `process_requests` loop deterministically.
        stop_on_idle: Option<Arc<AtomicBool>>,
    }

    #[derive(Default)]
    struct FakeState {
        running: Vec<RequestId>,
        finished: Vec<(RequestId, TaskResult)>,
        started: Vec<RequestId>,
        terminated: Vec<RequestId>,
        ticks: usize,
        idle_sleeps: usize,
    }

    impl FakeManager {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                inner: Mutex::new(FakeState::default()),
                stop_on_idle: None,
            }
        }

        fn stopping_on_idle(capacity: usize, running: Arc<AtomicBool>) -> Self {
            Self {
                capacity,
                inner: Mutex::new(FakeState::default()),
                stop_on_idle: Some(running),
            }
        }

        fn finish(&self, id: &RequestId, result: TaskResult) {
            let mut state = self.inner.lock().unwrap();
            state.running.retain(|r| r != id);
            state.finished.push((id.clone(), result));
        }

        fn running_ids(&self) -> Vec<RequestId> {
            self.inner.lock().unwrap().running.clone()
        }

        fn started_ids(&self) -> Vec<RequestId> {
            self.inner.lock().unwrap().started.clone()
        }

        fn terminated_ids(&self) -> Vec<RequestId> {
            self.inner.lock().unwrap().terminated.clone()
        }

        fn ticks(&self) -> usize {
            self.inner.lock().unwrap().ticks
        }

        fn idle_sleeps(&self) -> usize {
            self.inner.lock().unwrap().idle_sleeps
        }
    }

    #[async_trait]
    impl TaskManager for FakeManager {
        async fn start_tick(&self) {
            self.inner.lock().unwrap().ticks += 1;
        }

        async fn has_capacity(&self) -> bool {
            let state = self.inner.lock().unwrap();
            state.running.len() < self.capacity
        }

        async fn start_task(&self, id: &RequestId, _payload: serde_json::Value) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.running.push(id.clone());
            state.started.push(id.clone());
            Ok(())
        }

        async fn terminate_task(&self, id: &RequestId) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.running.retain(|r| r != id);
            state.terminated.push(id.clone());
            Ok(())
        }

        async fn reap(&self) -> Result<Vec<(RequestId, TaskResult)>> {
            Ok(std::mem::take(&mut self.inner.lock().unwrap().finished))
        }

        async fn idle_sleep(&self, _interval: Duration) {
            // simulated time: count instead of sleeping
            self.inner.lock().unwrap().idle_sleeps += 1;
            if let Some(flag) = &self.stop_on_idle {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        spool: Spool,
        client: WorkQueueClient,
        server: WorkQueueServer,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool.create().await.unwrap();
        let client = WorkQueueClient::new(spool.clone());
        let server = WorkQueueServer::new(
            spool.clone(),
            ServerConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );
        Fixture {
            _dir: dir,
            spool,
            client,
            server,
        }
    }

    #[tokio::test]
    async fn test_tick_discovers_and_starts_request() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!("work")).await.unwrap();

        assert!(f.server.tick(&manager).await.unwrap());

        assert_eq!(manager.started_ids(), vec![id.clone()]);
        assert_eq!(
            f.spool.find_state(&id).await.unwrap(),
            Some(RequestState::Running)
        );
        assert_eq!(manager.ticks(), 1);
    }

    #[tokio::test]
    async fn test_tick_without_work_reports_no_progress() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);

        assert!(!f.server.tick(&manager).await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_gates_admission_in_id_order() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(2);

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(f.client.enqueue(&json!(i)).await.unwrap());
        }

        f.server.tick(&manager).await.unwrap();
        assert_eq!(manager.running_ids(), ids[..2].to_vec());
        assert_eq!(
            f.spool.list_request_ids(RequestState::Pending).await.unwrap(),
            ids[2..].to_vec()
        );

        // freeing one slot admits exactly the next id in order
        manager.finish(&ids[0], Ok(json!(null)));
        f.server.tick(&manager).await.unwrap();
        assert_eq!(manager.running_ids(), vec![ids[1].clone(), ids[2].clone()]);
        assert_eq!(manager.started_ids(), ids[..3].to_vec());
    }

    #[tokio::test]
    async fn test_zero_capacity_starts_nothing() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(0);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        f.server.tick(&manager).await.unwrap();

        assert!(manager.started_ids().is_empty());
        assert_eq!(
            f.spool.find_state(&id).await.unwrap(),
            Some(RequestState::Pending)
        );
    }

    #[tokio::test]
    async fn test_completion_reaches_waiting_client() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!("blurbity-blurb")).await.unwrap();

        f.server.tick(&manager).await.unwrap();
        manager.finish(&id, Ok(json!("not blurbity at all")));
        f.server.tick(&manager).await.unwrap();

        let result: String = f.client.wait(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, "not blurbity at all");

        // every container is empty of the id afterwards
        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_failure_is_isolated_and_reraised() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(2);
        let failing = f.client.enqueue(&json!("bad")).await.unwrap();
        let healthy = f.client.enqueue(&json!("good")).await.unwrap();

        f.server.tick(&manager).await.unwrap();
        manager.finish(&failing, Err(TaskError::new("task exploded")));
        manager.finish(&healthy, Ok(json!("fine")));
        f.server.tick(&manager).await.unwrap();

        let err = f
            .client
            .wait::<serde_json::Value>(&failing, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            QueueError::TaskFailed(message) => assert_eq!(message, "task exploded"),
            other => panic!("expected TaskFailed, got {:?}", other),
        }

        // the failure never touched the other request
        let result: String = f.client.wait(&healthy, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, "fine");
    }

    #[tokio::test]
    async fn test_abort_while_requested_never_starts() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!(null)).await.unwrap();
        f.client.abort(&id).await.unwrap();

        f.server.tick(&manager).await.unwrap();

        assert!(manager.started_ids().is_empty());
        assert!(manager.terminated_ids().is_empty());
        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_while_pending_never_starts() {
        let f = fixture().await;
        let gate = FakeManager::with_capacity(0);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        f.server.tick(&gate).await.unwrap();
        assert_eq!(
            f.spool.find_state(&id).await.unwrap(),
            Some(RequestState::Pending)
        );

        f.client.abort(&id).await.unwrap();
        let manager = FakeManager::with_capacity(1);
        f.server.tick(&manager).await.unwrap();

        assert!(manager.started_ids().is_empty());
        assert!(manager.terminated_ids().is_empty());
        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_while_running_terminates_once() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        f.server.tick(&manager).await.unwrap();
        assert_eq!(manager.running_ids(), vec![id.clone()]);

        f.client.abort(&id).await.unwrap();
        f.server.tick(&manager).await.unwrap();

        assert_eq!(manager.terminated_ids(), vec![id.clone()]);
        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());

        // no completion ever appears for the aborted id
        f.server.tick(&manager).await.unwrap();
        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_late_result_after_abort_is_discarded() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        f.server.tick(&manager).await.unwrap();

        // the task finishes in the same window the abort arrives; the abort
        // is drained first and the reaped result must be dropped
        f.client.abort(&id).await.unwrap();
        manager.finish(&id, Ok(json!("too late")));
        f.server.tick(&manager).await.unwrap();

        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_after_completion_discards_stored_result() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        f.server.tick(&manager).await.unwrap();
        manager.finish(&id, Ok(json!("result")));
        f.server.tick(&manager).await.unwrap();
        assert_eq!(
            f.spool.find_state(&id).await.unwrap(),
            Some(RequestState::Complete)
        );

        // a timed-out waiter set the marker after the result landed
        f.client.abort(&id).await.unwrap();
        f.server.tick(&manager).await.unwrap();

        assert_eq!(f.spool.find_state(&id).await.unwrap(), None);
        assert!(f.spool.list_abort_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_exclusivity_across_lifecycle() {
        let f = fixture().await;
        let manager = FakeManager::with_capacity(1);
        let id = f.client.enqueue(&json!(null)).await.unwrap();

        for _ in 0..4 {
            let mut occupied = 0;
            for state in RequestState::ALL {
                if f.spool
                    .list_request_ids(state)
                    .await
                    .unwrap()
                    .contains(&id)
                {
                    occupied += 1;
                }
            }
            assert!(occupied <= 1, "id present in {} states", occupied);
            f.server.tick(&manager).await.unwrap();
            if let Some(RequestState::Running) = f.spool.find_state(&id).await.unwrap() {
                manager.finish(&id, Ok(json!(null)));
            }
        }
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_as_error_completion() {
        struct RefusingManager;

        #[async_trait]
        impl TaskManager for RefusingManager {
            async fn start_tick(&self) {}
            async fn has_capacity(&self) -> bool {
                true
            }
            async fn start_task(&self, _id: &RequestId, _payload: serde_json::Value) -> Result<()> {
                Err(QueueError::TaskFailed("no executor available".to_string()))
            }
            async fn terminate_task(&self, _id: &RequestId) -> Result<()> {
                Ok(())
            }
            async fn reap(&self) -> Result<Vec<(RequestId, TaskResult)>> {
                Ok(Vec::new())
            }
        }

        let f = fixture().await;
        let id = f.client.enqueue(&json!(null)).await.unwrap();
        f.server.tick(&RefusingManager).await.unwrap();

        let err = f
            .client
            .wait::<serde_json::Value>(&id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_process_requests_sleeps_only_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        spool.create().await.unwrap();
        let client = WorkQueueClient::new(spool.clone());

        let running = Arc::new(AtomicBool::new(true));
        let server = WorkQueueServer::new(spool.clone(), ServerConfig::default(), running.clone());
        let manager = FakeManager::stopping_on_idle(1, running);

        let id = client.enqueue(&json!("work")).await.unwrap();
        server.process_requests(&manager).await.unwrap();

        // the first iteration made progress without sleeping; only the idle
        // one that followed suspended, and it stopped the loop
        assert_eq!(manager.started_ids(), vec![id]);
        assert_eq!(manager.idle_sleeps(), 1);
        assert!(manager.ticks() >= 2);
    }

    #[tokio::test]
    async fn test_storage_failure_escapes_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"));
        spool.create().await.unwrap();
        let server = WorkQueueServer::new(
            spool.clone(),
            ServerConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );
        let manager = FakeManager::with_capacity(1);

        tokio::fs::remove_dir_all(dir.path().join("spool")).await.unwrap();

        let err = server.tick(&manager).await.unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
    }
}
