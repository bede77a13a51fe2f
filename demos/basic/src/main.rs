//! Basic example running the work queue end to end in one process.
//!
//! This example demonstrates:
//! - Creating a filesystem spool
//! - Enqueueing requests from a client
//! - Processing them with the server loop and a local task manager
//! - Aborting a request before it completes
//!
//! Run with: `cargo run -p demo-basic`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use spoolq_core::{
    QueueError, RequestId, ServerConfig, Spool, TaskError, WorkQueueClient, WorkQueueServer,
};
use spoolq_local::LocalTaskManager;

/// Greeting request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeting {
    name: String,
    slow: bool,
}

#[tokio::main]
async fn main() -> spoolq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("spoolq work queue example\n");

    let root = std::env::temp_dir().join(format!("spoolq-demo-{}", std::process::id()));
    let spool = Spool::new(&root);
    spool.create().await?;

    let client = WorkQueueClient::new(spool.clone());

    // Server loop with a local task manager, capacity 2
    let running = Arc::new(AtomicBool::new(true));
    let server = WorkQueueServer::new(
        spool.clone(),
        ServerConfig {
            sample_interval: Duration::from_millis(50),
        },
        running.clone(),
    );
    let server_task = tokio::spawn(async move {
        let manager = LocalTaskManager::new(2, |id: RequestId, payload: serde_json::Value| {
            async move {
                let greeting: Greeting =
                    serde_json::from_value(payload).map_err(TaskError::from)?;
                if greeting.slow {
                    // long enough for the client to abort it first
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                println!("[task {}] greeting {}", id, greeting.name);
                Ok(json!(format!("Hello, {}!", greeting.name)))
            }
        });
        server.process_requests(&manager).await
    });

    let names = ["alice", "bob", "charlie", "diana", "eve"];
    println!("Enqueueing {} requests...\n", names.len());

    let mut ids = Vec::new();
    for name in names {
        let id = client
            .enqueue(&Greeting {
                name: name.to_string(),
                slow: false,
            })
            .await?;
        println!("  enqueued: {}", id);
        ids.push(id);
    }

    // one more that will never finish on its own
    let doomed = client
        .enqueue(&Greeting {
            name: "nobody".to_string(),
            slow: true,
        })
        .await?;

    for id in &ids {
        let result: String = client.wait(id, Duration::from_secs(10)).await?;
        println!("  completed {}: {}", id, result);
    }

    println!("\nAborting {}...", doomed);
    client.abort(&doomed).await?;
    match client.wait::<String>(&doomed, Duration::from_secs(2)).await {
        Err(QueueError::Timeout(_)) => println!("  aborted request never completed, as expected"),
        other => println!("  unexpected outcome: {:?}", other),
    }

    println!("\nFinal stats: {:?}", client.stats().await?);

    running.store(false, Ordering::SeqCst);
    server_task.await.expect("server task panicked")?;

    tokio::fs::remove_dir_all(&root).await.ok();
    Ok(())
}
