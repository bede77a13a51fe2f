//! Configuration types for the work queue.

use std::time::Duration;

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay between completion polls inside `wait`, bounded by the
    /// remaining deadline.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Configuration for the server scheduler loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long an idle iteration suspends before sampling the spool again.
    pub sample_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
        }
    }
}
