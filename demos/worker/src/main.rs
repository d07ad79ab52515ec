//! # Worker
//!
//! Runs one worker against `email-send`, printing each job's payload and
//! completing it. `Ctrl-C` triggers a graceful `stop()`.

use anyhow::Result;
use jobq_core::worker::WorkerOptions;
use jobq_core::{Manager, ManagerConfig, OffWorkSelector};
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

    let worker_id = manager
        .work(
            QUEUE,
            WorkerOptions::default(),
            Arc::new(|jobs| {
                Box::pin(async move {
                    for job in &jobs {
                        println!("sending email: {}", job.data);
                    }
                    Ok(None)
                })
            }),
        )
        .await?;

    println!("worker {worker_id} running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    manager.off_work(OffWorkSelector::Id(worker_id)).await?;
    println!("worker stopped");

    Ok(())
}
