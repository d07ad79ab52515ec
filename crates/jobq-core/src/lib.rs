//! # jobq-core
//!
//! Database-agnostic core of a durable, transactional job queue: the
//! queue/job domain model, the storage contracts a backend must satisfy,
//! the per-queue worker polling loop, and the manager facade embedders
//! construct.
//!
//! ## Architecture
//!
//! ```text
//! Producer ──send()──► Manager ──insert_job()──► Backend (JobStore)
//!                          │
//!                          ▼ work()
//!                       Worker loop ──fetch_next_job()──► Backend
//!                          │
//!                          ▼ handler(batch)
//!                   complete_jobs() / fail_jobs_by_id() ──► Backend
//! ```
//!
//! `jobq-postgres::PgBackend` is the production [`Backend`] implementation.
//! `jobq-testing::FakeBackend` is an in-memory one used by this crate's own
//! worker/manager tests, so the polling loop's deadline-racing and
//! at-most-one-claim behavior can be exercised without a live database.
//!
//! ## Key invariants
//!
//! 1. A job's state only ever advances through the total order
//!    `Created < Retry < Active < Completed < Cancelled < Failed`.
//! 2. Singleton/short/stately/throttle/debounce uniqueness is enforced by
//!    the backend's unique indexes at insert time, never by an
//!    application-side lock — a collision is a normal `Ok(None)`.
//! 3. A fetched job is exclusively owned by one worker until it reaches a
//!    terminal state or its claim's lease expires.
//! 4. The queue-metadata cache and worker registry are the only mutable
//!    shared state in the manager; the backend is the source of truth for
//!    job state.
//!
//! ## Example
//!
//! ```ignore
//! use jobq_core::{Manager, ManagerConfig, QueueOptions, SendOptions};
//! use jobq_core::worker::WorkerOptions;
//! use std::sync::Arc;
//!
//! let manager = Manager::new(backend, ManagerConfig::default());
//! manager.create_queue("email-send", QueueOptions::default()).await?;
//! manager.send("email-send", serde_json::json!({"to": "a@b.com"}), SendOptions::default()).await?;
//!
//! manager.work("email-send", WorkerOptions::default(), Arc::new(|jobs| {
//!     Box::pin(async move {
//!         for job in &jobs {
//!             println!("handling {}", job.id);
//!         }
//!         Ok(None)
//!     })
//! })).await?;
//! ```

mod backend;
mod error;
mod job;
mod manager;
mod pubsub;
pub mod worker;

pub use backend::{Backend, JobStore, QueueRegistry, SubscriptionStore};
pub use error::{BatchOutcome, Categorizable, JobQueueError, SafeErrorCategory};
pub use job::{
    validate_queue_name, BatchResult, FailureInfo, FetchOptions, InsertJobOptions, Job, JobState,
    Policy, Queue, QueueOptions, SendOptions, UpdateQueueOptions,
};
pub use manager::{Manager, ManagerConfig, OffWorkSelector};
pub use pubsub::{Event, EventBus, EventTap, WipSnapshot};
pub use worker::{Handler, HandlerResult, WorkerHandle, WorkerOptions, WorkerState};

// Re-exported so downstream `impl Backend for ...` blocks don't need their
// own `async-trait` dependency just to write the attribute.
pub use async_trait::async_trait;

#[cfg(test)]
mod integration_tests;
