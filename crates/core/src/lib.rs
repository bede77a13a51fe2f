//! # spoolq-core - Filesystem-backed local work queue
//!
//! This crate provides the core of the spoolq work queue system:
//! - `Spool`: durable directory store holding one entry per request per state
//! - `WorkQueueClient` for enqueueing work, aborting it, and waiting on results
//! - `WorkQueueServer` scheduler loop driving a pluggable task backend
//! - `TaskManager` trait for execution backends
//! - Error types
//!
//! The client and server may live in different processes; the spool directory
//! is their only shared state, and every mutation to it is a single atomic
//! filesystem operation.

mod client;
mod config;
mod error;
mod manager;
mod request;
mod server;
mod spool;

// Re-export main types
pub use client::{QueueStats, WorkQueueClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{QueueError, Result};
pub use manager::{TaskError, TaskManager, TaskResult};
pub use request::{Completion, RequestId, RequestState};
pub use server::WorkQueueServer;
pub use spool::Spool;
