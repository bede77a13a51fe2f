//! Filesystem spool store.
//!
//! The spool is the only shared state between clients and the server: one
//! container directory per request state, plus an abort-marker container.
//! Every observable mutation is a single atomic create, link, rename, or
//! delete, never a read-modify-write, so a crash between operations can
//! never leave a request duplicated or missing. No cross-process lock is
//! ever taken.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;

use crate::error::{QueueError, Result};
use crate::request::{RequestId, RequestState};

/// Container directory for abort markers.
const ABORTING_DIR: &str = "aborting";

/// Staging area for entry bodies that become visible via link/rename.
const SCRATCH_DIR: &str = "scratch";

/// Disambiguates scratch file names within a process.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Durable, crash-tolerant holder of request state keyed by `(state, id)`.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    /// Create a handle for the spool rooted at `root`.
    ///
    /// No filesystem access happens here; call [`Spool::create`] to ensure
    /// the on-disk layout exists.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The spool's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Idempotently ensure the on-disk layout exists.
    pub async fn create(&self) -> Result<()> {
        for state in RequestState::ALL {
            fs::create_dir_all(self.root.join(state.dir_name())).await?;
        }
        fs::create_dir_all(self.root.join(ABORTING_DIR)).await?;
        fs::create_dir_all(self.root.join(SCRATCH_DIR)).await?;
        Ok(())
    }

    fn entry_path(&self, state: RequestState, id: &RequestId) -> PathBuf {
        self.root.join(state.dir_name()).join(id.as_str())
    }

    fn marker_path(&self, id: &RequestId) -> PathBuf {
        self.root.join(ABORTING_DIR).join(id.as_str())
    }

    fn scratch_path(&self, id: &RequestId) -> PathBuf {
        // pid plus a process-local sequence number: concurrent processes and
        // concurrent operations on the same id never share a staging file
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root.join(SCRATCH_DIR).join(format!(
            "{}.{}.{}",
            id.as_str(),
            std::process::id(),
            seq
        ))
    }

    /// Atomically create the entry for `id` in `state`.
    ///
    /// The body is staged in the scratch area and published with a single
    /// hard link, which also detects an existing entry without a
    /// read-then-write race.
    pub async fn put(
        &self,
        state: RequestState,
        id: &RequestId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let staged = self.scratch_path(id);
        fs::write(&staged, &body).await?;

        let linked = fs::hard_link(&staged, self.entry_path(state, id)).await;
        fs::remove_file(&staged).await.ok();

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(QueueError::DuplicateRequest(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the stored payload for `id` in `state`.
    pub async fn get(&self, state: RequestState, id: &RequestId) -> Result<serde_json::Value> {
        let bytes = match fs::read(self.entry_path(state, id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically move `id` from one state container to another.
    ///
    /// Fails with [`QueueError::TransitionConflict`] if the source entry is
    /// missing, e.g. because the request was aborted concurrently.
    pub async fn transition(
        &self,
        id: &RequestId,
        from: RequestState,
        to: RequestState,
    ) -> Result<()> {
        match fs::rename(self.entry_path(from, id), self.entry_path(to, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::TransitionConflict {
                    id: id.clone(),
                    from,
                    to,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All request ids currently in `state`, in ascending id order.
    ///
    /// Safe to re-call; never mutates.
    pub async fn list_request_ids(&self, state: RequestState) -> Result<Vec<RequestId>> {
        self.list_dir(&self.root.join(state.dir_name())).await
    }

    /// Remove the entry for `id` in `state`.
    pub async fn delete(&self, state: RequestState, id: &RequestId) -> Result<()> {
        match fs::remove_file(self.entry_path(state, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::NotFound(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim and consume the entry for `id` in `state`.
    ///
    /// The rename is the claim: of two racing callers exactly one obtains
    /// the payload, the other sees [`QueueError::NotFound`]. A consumed
    /// entry can therefore never be delivered twice.
    pub async fn take(&self, state: RequestState, id: &RequestId) -> Result<serde_json::Value> {
        let claimed = self.scratch_path(id);
        match fs::rename(self.entry_path(state, id), &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let bytes = fs::read(&claimed).await?;
        fs::remove_file(&claimed).await.ok();
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Flag `id` for teardown, independent of its current state. Idempotent.
    pub async fn set_abort_marker(&self, id: &RequestId) -> Result<()> {
        fs::write(self.marker_path(id), b"").await?;
        Ok(())
    }

    /// Remove the abort marker for `id`, acknowledging the abort. Clearing
    /// an absent marker is a no-op.
    pub async fn clear_abort_marker(&self, id: &RequestId) -> Result<()> {
        match fs::remove_file(self.marker_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All request ids with an abort marker set, in ascending id order.
    pub async fn list_abort_markers(&self) -> Result<Vec<RequestId>> {
        self.list_dir(&self.root.join(ABORTING_DIR)).await
    }

    /// Which exclusive state container currently holds `id`, if any.
    pub async fn find_state(&self, id: &RequestId) -> Result<Option<RequestState>> {
        for state in RequestState::ALL {
            if fs::try_exists(self.entry_path(state, id)).await? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<RequestId>> {
        let mut entries = fs::read_dir(dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(RequestId::from(name));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
