//! The embedder-facing facade: lifecycle, queue-metadata cache, worker
//! registry, and event emission.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{BatchOutcome, JobQueueError};
use crate::job::{
    validate_queue_name, BatchResult, FailureInfo, InsertJobOptions, Job, Queue, QueueOptions,
    SendOptions, UpdateQueueOptions,
};
use crate::pubsub::{EventBus, EventTap};
use crate::worker::{self, Handler, WorkerHandle, WorkerOptions, SHUTDOWN_FAILURE_REASON};

/// How often the queue-metadata cache refreshes in the background.
const CACHE_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Configuration recognized by the manager, typed.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub schema: String,
    pub polling_interval: StdDuration,
    pub expire_in_default: StdDuration,
    pub keep_until_default: StdDuration,
    pub retry_limit_default: i32,
    pub retry_delay_default: i32,
    pub retry_backoff_default: bool,
    pub archive_completed_after: StdDuration,
    pub monitor_state_interval: StdDuration,
    /// Test-only hook matching the original's `__test__throw_worker`
    /// toggle; forces the next fetch to error, to exercise the swallow
    /// path. Named with the reserved `__` prefix deliberately — it is an
    /// internal switch, not a queue name.
    pub __test_throw_worker: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            schema: "job_queue".to_string(),
            polling_interval: StdDuration::from_secs(2),
            expire_in_default: StdDuration::from_secs(15 * 60),
            keep_until_default: StdDuration::from_secs(14 * 24 * 60 * 60),
            retry_limit_default: 0,
            retry_delay_default: 0,
            retry_backoff_default: false,
            archive_completed_after: StdDuration::from_secs(60 * 60),
            monitor_state_interval: StdDuration::from_secs(30),
            __test_throw_worker: false,
        }
    }
}

/// A cached, eventually-consistent copy of a queue's metadata row.
#[derive(Debug, Clone)]
struct CachedQueue {
    queue: Queue,
    cached_on: DateTime<Utc>,
}

/// Which worker(s) `off_work` should stop.
pub enum OffWorkSelector {
    Name(String),
    Id(Uuid),
}

/// The manager facade. Cheap to clone — internals are `Arc`-shared so
/// clones observe the same worker registry and cache.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: ManagerConfig,
    queue_cache: DashMap<String, CachedQueue>,
    workers: DashMap<Uuid, WorkerHandle>,
    events: EventBus,
    cache_refresh: std::sync::Mutex<Option<JoinHandle<()>>>,
    archive_sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(backend: Arc<dyn Backend>, config: ManagerConfig) -> Self {
        let inner = Arc::new(Inner {
            backend,
            config,
            queue_cache: DashMap::new(),
            workers: DashMap::new(),
            events: EventBus::new(),
            cache_refresh: std::sync::Mutex::new(None),
            archive_sweep: std::sync::Mutex::new(None),
        });
        let manager = Self { inner };
        manager.spawn_cache_refresh();
        manager.spawn_archive_sweep();
        manager
    }

    /// Periodically move terminal jobs whose retention window has elapsed
    /// into the archive, one queue at a time. Failures are logged and
    /// emitted as events rather than aborting the sweep — a single
    /// queue's backend error should not stop the rest from archiving.
    fn spawn_archive_sweep(&self) {
        let inner = self.inner.clone();
        let interval = inner.config.archive_completed_after;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let queues = match inner.backend.get_queues().await {
                    Ok(queues) => queues,
                    Err(err) => {
                        tracing::warn!(error = %err, "archive sweep could not list queues");
                        inner.events.emit_error(err.to_string(), None, None);
                        continue;
                    }
                };
                let now = Utc::now();
                for queue in queues {
                    match inner.backend.archive_terminal_jobs(&queue.name, now).await {
                        Ok(count) if count > 0 => {
                            tracing::debug!(queue = %queue.name, count, "archived terminal jobs");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(queue = %queue.name, error = %err, "archive sweep failed");
                            inner.events.emit_error(err.to_string(), Some(queue.name.clone()), None);
                        }
                    }
                }
            }
        });
        *self
            .inner
            .archive_sweep
            .lock()
            .expect("archive sweep lock poisoned") = Some(handle);
    }

    fn spawn_cache_refresh(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                match inner.backend.get_queues().await {
                    Ok(queues) => {
                        let now = Utc::now();
                        for queue in queues {
                            inner.queue_cache.insert(
                                queue.name.clone(),
                                CachedQueue {
                                    queue,
                                    cached_on: now,
                                },
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "queue-metadata cache refresh failed");
                        inner.events.emit_error(err.to_string(), None, None);
                    }
                }
            }
        });
        *self.inner.cache_refresh.lock().expect("cache refresh lock poisoned") = Some(handle);
    }

    pub fn subscribe_events(&self) -> EventTap {
        self.inner.events.subscribe()
    }

    // ---- Queue registry ----------------------------------------------

    pub async fn create_queue(&self, name: &str, opts: QueueOptions) -> Result<(), JobQueueError> {
        validate_queue_name(name)?;
        if let Some(dead_letter) = &opts.dead_letter {
            validate_queue_name(dead_letter)?;
            if dead_letter == name {
                return Err(JobQueueError::validation(format!(
                    "queue '{name}' cannot be its own dead-letter queue"
                )));
            }
        }
        self.inner.backend.create_queue(name, opts).await?;
        self.inner.queue_cache.remove(name);
        tracing::info!(queue = %name, "queue created");
        Ok(())
    }

    pub async fn update_queue(
        &self,
        name: &str,
        opts: UpdateQueueOptions,
    ) -> Result<(), JobQueueError> {
        validate_queue_name(name)?;
        self.inner.backend.update_queue(name, opts).await?;
        self.inner.queue_cache.remove(name);
        Ok(())
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), JobQueueError> {
        self.inner.backend.delete_queue(name).await?;
        self.inner.queue_cache.remove(name);
        Ok(())
    }

    pub async fn purge_queue(&self, name: &str) -> Result<(), JobQueueError> {
        self.inner.backend.purge_queue(name).await
    }

    pub async fn get_queue_size(
        &self,
        name: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<i64, JobQueueError> {
        self.inner.backend.get_queue_size(name, before).await
    }

    /// Lazily-filled, 60s-refreshed lookup — a newly created queue is
    /// visible on the next cache miss, deletion is best-effort.
    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>, JobQueueError> {
        if let Some(cached) = self.inner.queue_cache.get(name) {
            return Ok(Some(cached.queue.clone()));
        }
        let queue = self.inner.backend.get_queue(name).await?;
        if let Some(queue) = &queue {
            self.inner.queue_cache.insert(
                name.to_string(),
                CachedQueue {
                    queue: queue.clone(),
                    cached_on: Utc::now(),
                },
            );
        }
        Ok(queue)
    }

    pub async fn get_queues(&self) -> Result<Vec<Queue>, JobQueueError> {
        self.inner.backend.get_queues().await
    }

    // ---- Send variants -------------------------------------------------

    pub async fn send(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: SendOptions,
    ) -> Result<Option<Uuid>, JobQueueError> {
        validate_queue_name(name)?;
        let insert_opts = self.build_insert_opts(data, opts, Utc::now(), None, None, None);
        self.inner.backend.insert_job(name, insert_opts).await
    }

    pub async fn send_after(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: SendOptions,
        after: DateTime<Utc>,
    ) -> Result<Option<Uuid>, JobQueueError> {
        validate_queue_name(name)?;
        let insert_opts = self.build_insert_opts(data, opts, after, None, None, None);
        self.inner.backend.insert_job(name, insert_opts).await
    }

    /// Collisions within the current time bucket are dropped silently —
    /// the unique-index violation is absorbed by `insert_job`, returning
    /// `Ok(None)`.
    pub async fn send_throttled(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: SendOptions,
        seconds: i64,
        key: Option<String>,
    ) -> Result<Option<Uuid>, JobQueueError> {
        validate_queue_name(name)?;
        let insert_opts =
            self.build_insert_opts(data, opts, Utc::now(), Some(seconds), key, None);
        self.inner.backend.insert_job(name, insert_opts).await
    }

    /// Like `send_throttled`, but a first-bucket collision retries once
    /// with `start_after` pushed to the next bucket boundary.
    pub async fn send_debounced(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: SendOptions,
        seconds: i64,
        key: Option<String>,
    ) -> Result<Option<Uuid>, JobQueueError> {
        validate_queue_name(name)?;
        let first_opts = self.build_insert_opts(
            data.clone(),
            opts.clone(),
            Utc::now(),
            Some(seconds),
            key.clone(),
            None,
        );
        if let Some(id) = self.inner.backend.insert_job(name, first_opts).await? {
            return Ok(Some(id));
        }

        let now = Utc::now();
        let mut start_after_secs = seconds_until_next_bucket(now, seconds);
        if seconds > 1 {
            start_after_secs += 1;
        }
        start_after_secs = start_after_secs.max(1);

        let retry_after = now + Duration::seconds(start_after_secs);
        let retry_opts =
            self.build_insert_opts(data, opts, retry_after, Some(seconds), key, Some(seconds));
        self.inner.backend.insert_job(name, retry_opts).await
    }

    fn build_insert_opts(
        &self,
        data: serde_json::Value,
        opts: SendOptions,
        start_after: DateTime<Utc>,
        singleton_seconds: Option<i64>,
        singleton_key: Option<String>,
        singleton_offset: Option<i64>,
    ) -> InsertJobOptions {
        InsertJobOptions {
            id: opts.id,
            data,
            priority: opts.priority,
            start_after,
            singleton_key,
            singleton_seconds,
            singleton_offset,
            expire_in_seconds: opts.expire_in_seconds,
            keep_until: opts.keep_until,
            retry_limit: opts.retry_limit,
            retry_delay: opts.retry_delay,
            retry_backoff: opts.retry_backoff,
        }
    }

    pub async fn insert(
        &self,
        name: &str,
        jobs: Vec<InsertJobOptions>,
    ) -> Result<Vec<Option<Uuid>>, JobQueueError> {
        validate_queue_name(name)?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.inner.backend.insert_job(name, job).await?);
        }
        Ok(ids)
    }

    // ---- Fetch / report ------------------------------------------------

    pub async fn fetch(
        &self,
        name: &str,
        opts: crate::job::FetchOptions,
    ) -> Result<Vec<Job>, JobQueueError> {
        // Fetch specifically swallows transport errors into an empty batch
        // rather than propagating them — the same contention that produces
        // a unique-index collision on claim is the expected error class
        // here, and callers should just see nothing ready yet.
        match self.inner.backend.fetch_next_job(name, opts).await {
            Ok(batch) => Ok(batch),
            Err(err) => {
                tracing::warn!(queue = %name, error = %err, "fetch failed, treating as empty batch");
                self.inner.events.emit_error(err.to_string(), Some(name.to_string()), None);
                Ok(Vec::new())
            }
        }
    }

    pub async fn complete(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<BatchResult, JobQueueError> {
        self.inner.backend.complete_jobs(name, ids, output).await
    }

    pub async fn fail(
        &self,
        name: &str,
        ids: &[Uuid],
        failure: FailureInfo,
    ) -> Result<BatchResult, JobQueueError> {
        self.inner.backend.fail_jobs_by_id(name, ids, &failure).await
    }

    pub async fn cancel(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        self.inner.backend.cancel_jobs(name, ids).await
    }

    pub async fn resume(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        self.inner.backend.resume_jobs(name, ids).await
    }

    pub async fn delete_job(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        self.inner.backend.delete_jobs(name, ids).await
    }

    pub async fn get_job_by_id(
        &self,
        name: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>, JobQueueError> {
        self.inner.backend.get_job_by_id(name, id, include_archive).await
    }

    // ---- Pub/sub job fan-out --------------------------------------------

    pub async fn subscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        self.inner.backend.subscribe(event, name).await
    }

    pub async fn unsubscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        self.inner.backend.unsubscribe(event, name).await
    }

    /// Resolve every queue subscribed to `event`, `send` each one, and
    /// await all outcomes together — one failure does not cancel the
    /// others.
    pub async fn publish(
        &self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<BatchOutcome<Uuid>, JobQueueError> {
        let names = self.inner.backend.get_queues_for_event(event).await?;
        let sends = names.into_iter().map(|name| {
            let data = data.clone();
            async move {
                let result = self.send(&name, data, SendOptions::default()).await;
                (name, result)
            }
        });

        let results = join_all(sends).await;
        let mut outcome = BatchOutcome::default();
        for (name, result) in results {
            match result {
                Ok(Some(id)) => outcome.succeeded.push(id),
                Ok(None) => {}
                Err(err) => outcome.failed.push((name, err.to_string())),
            }
        }
        Ok(outcome)
    }

    // ---- Worker registry -----------------------------------------------

    /// Spawn a worker polling `name` and return its id.
    pub async fn work(
        &self,
        name: &str,
        options: WorkerOptions,
        handler: Handler,
    ) -> Result<Uuid, JobQueueError> {
        validate_queue_name(name)?;
        let id = Uuid::new_v4();
        let handle = worker::spawn(
            id,
            name.to_string(),
            self.inner.backend.clone(),
            options,
            handler,
            self.inner.events.clone(),
        );
        self.inner.workers.insert(id, handle);
        tracing::info!(queue = %name, worker = %id, "worker started");
        Ok(id)
    }

    pub fn notify_worker(&self, id: Uuid) {
        if let Some(handle) = self.inner.workers.get(&id) {
            handle.notify();
        }
    }

    /// Stop worker(s) matching `selector` and wait for them to reach
    /// `Stopped` before removing them from the registry.
    pub async fn off_work(&self, selector: OffWorkSelector) -> Result<(), JobQueueError> {
        let matching: Vec<Uuid> = match selector {
            OffWorkSelector::Id(id) => vec![id],
            OffWorkSelector::Name(name) => self
                .inner
                .workers
                .iter()
                .filter(|entry| entry.value().name == name)
                .map(|entry| *entry.key())
                .collect(),
        };

        for id in matching {
            if let Some((_, handle)) = self.inner.workers.remove(&id) {
                handle.stop();
                handle.join().await;
            }
        }
        Ok(())
    }

    /// Stop every worker gracefully and wait for all of them to finish.
    pub async fn stop(&self) -> Result<(), JobQueueError> {
        tracing::info!("manager stopping, waiting for workers to drain");
        let ids: Vec<Uuid> = self.inner.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.off_work(OffWorkSelector::Id(id)).await?;
        }
        if let Some(handle) = self.inner.cache_refresh.lock().expect("cache refresh lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self
            .inner
            .archive_sweep
            .lock()
            .expect("archive sweep lock poisoned")
            .take()
        {
            handle.abort();
        }
        Ok(())
    }

    /// Ungraceful shutdown: fail every in-flight job across every worker
    /// with the sentinel reason, without waiting for the loops to settle.
    pub async fn fail_wip(&self) -> Result<(), JobQueueError> {
        let failure = FailureInfo::from_message(SHUTDOWN_FAILURE_REASON);
        let snapshots: Vec<(String, Vec<Uuid>)> = self
            .inner
            .workers
            .iter()
            .map(|entry| (entry.value().name.clone(), entry.value().in_flight_ids()))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();

        for (name, ids) in snapshots {
            if let Err(err) = self.inner.backend.fail_jobs_by_id(&name, &ids, &failure).await {
                tracing::error!(queue = %name, error = %err, "failed to fail in-flight jobs during shutdown");
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

/// Seconds until the start of the next `seconds`-wide bucket after `now`,
/// clock-skew adjusted by flooring against the epoch the same way
/// `singleton_on` buckets are computed at insert time.
fn seconds_until_next_bucket(now: DateTime<Utc>, seconds: i64) -> i64 {
    if seconds <= 0 {
        return 1;
    }
    let epoch_seconds = now.timestamp();
    let remainder = epoch_seconds.rem_euclid(seconds);
    seconds - remainder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_bucket_is_never_in_the_past() {
        let now = Utc::now();
        for seconds in [1, 5, 10, 60] {
            let delta = seconds_until_next_bucket(now, seconds);
            assert!(delta >= 1);
            assert!(delta <= seconds);
        }
    }
}
