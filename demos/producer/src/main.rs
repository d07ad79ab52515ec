//! # Producer
//!
//! Sends a handful of jobs onto an `email-send` queue, including a
//! throttled one to show a duplicate within the window being dropped.
//! No framework ceremony - just `Manager::send*` directly.

use anyhow::Result;
use jobq_core::{Manager, ManagerConfig, QueueOptions, SendOptions};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

const QUEUE: &str = "email-send";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/jobq_demo".to_string());
    let pool = PgPoolOptions::new().max_connections(5).connect(&database_url).await?;

    let backend = jobq_postgres::PgBackend::new(pool, "job_queue");
    backend.migrate().await?;

    let manager = Manager::new(Arc::new(backend), ManagerConfig::default());
    manager.create_queue(QUEUE, QueueOptions::default()).await.ok();

    let recipients = ["a@example.com", "b@example.com", "c@example.com"];
    for to in recipients {
        let id = manager
            .send(QUEUE, serde_json::json!({ "to": to }), SendOptions::default())
            .await?;
        println!("queued {to} as {id:?}");
    }

    // A second send to the same recipient within the 60s window is dropped.
    let throttled = manager
        .send_throttled(
            QUEUE,
            serde_json::json!({ "to": "a@example.com" }),
            SendOptions::default(),
            60,
            Some("a@example.com".to_string()),
        )
        .await?;
    println!("throttled duplicate resolved to: {throttled:?}");

    Ok(())
}
