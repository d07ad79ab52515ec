//! Storage contracts the manager/worker runtime is built against.
//!
//! `jobq-core` never speaks SQL directly — `jobq-postgres::PgBackend` is
//! the production implementation, `jobq-testing::FakeBackend` is an
//! in-memory one used by this crate's own unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::job::{
    BatchResult, FailureInfo, FetchOptions, InsertJobOptions, Job, Queue, QueueOptions,
    UpdateQueueOptions,
};

/// Insert, fetch-with-lock, and state-transition operations over jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one job. Returns `Ok(None)` — not an error — when the
    /// queue's policy rejects the row via a unique-index conflict
    /// (short/singleton/stately/throttle/debounce collisions).
    async fn insert_job(
        &self,
        name: &str,
        opts: InsertJobOptions,
    ) -> Result<Option<Uuid>, JobQueueError>;

    /// Claim up to `opts.batch_size` ready jobs, transitioning them to
    /// `Active` under `FOR UPDATE SKIP LOCKED` (or the backend's
    /// equivalent). Ordered by priority (if requested) then creation.
    async fn fetch_next_job(
        &self,
        name: &str,
        opts: FetchOptions,
    ) -> Result<Vec<Job>, JobQueueError>;

    async fn complete_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<BatchResult, JobQueueError>;

    /// Fail a batch of jobs. Retries or dead-letters per the owning
    /// queue's policy.
    async fn fail_jobs_by_id(
        &self,
        name: &str,
        ids: &[Uuid],
        failure: &FailureInfo,
    ) -> Result<BatchResult, JobQueueError>;

    async fn cancel_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError>;

    /// Resume terminal jobs back to `Created`, unless they have already
    /// been archived.
    async fn resume_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError>;

    async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError>;

    async fn get_job_by_id(
        &self,
        name: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>, JobQueueError>;

    /// Move terminal jobs whose `keep_until` has passed into the archive,
    /// deleting them from the live partition. Driven by the manager's
    /// periodic retention sweep rather than a separate process.
    async fn archive_terminal_jobs(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, JobQueueError>;
}

/// CRUD over queues, their partitions, and their policy indexes.
#[async_trait]
pub trait QueueRegistry: Send + Sync {
    async fn create_queue(&self, name: &str, opts: QueueOptions) -> Result<(), JobQueueError>;

    async fn update_queue(
        &self,
        name: &str,
        opts: UpdateQueueOptions,
    ) -> Result<(), JobQueueError>;

    async fn delete_queue(&self, name: &str) -> Result<(), JobQueueError>;

    /// Delete every non-terminal job on the queue without dropping the
    /// queue itself.
    async fn purge_queue(&self, name: &str) -> Result<(), JobQueueError>;

    /// Count non-terminal jobs, optionally restricted to
    /// `start_after < before`.
    async fn get_queue_size(
        &self,
        name: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<i64, JobQueueError>;

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, JobQueueError>;

    async fn get_queues(&self) -> Result<Vec<Queue>, JobQueueError>;
}

/// `(event, name)` subscriptions backing `Manager::publish`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError>;

    async fn unsubscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError>;

    async fn get_queues_for_event(&self, event: &str) -> Result<Vec<String>, JobQueueError>;
}

/// Everything the manager needs from a storage implementation. Blanket
/// implemented for any type that has all three — a concrete backend only
/// has to implement `JobStore` + `QueueRegistry` + `SubscriptionStore`.
pub trait Backend: JobStore + QueueRegistry + SubscriptionStore {}

impl<T> Backend for T where T: JobStore + QueueRegistry + SubscriptionStore {}
