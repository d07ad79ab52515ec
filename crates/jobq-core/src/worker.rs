//! The per-queue polling loop.
//!
//! One [`Worker`] owns one `tokio` task: sleep-or-notify, fetch a batch,
//! dispatch it to the handler under a deadline, report the outcome, loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::JobQueueError;
use crate::job::{FailureInfo, FetchOptions, Job};
use crate::pubsub::{EventBus, WipSnapshot};

/// Lifecycle of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Active,
    Stopping,
    Stopped,
}

/// Tunables for one `work()` registration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub interval: StdDuration,
    pub batch_size: i64,
    pub priority: bool,
    pub include_metadata: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(2),
            batch_size: 1,
            priority: true,
            include_metadata: false,
        }
    }
}

/// Outcome of a handler invocation over one batch.
pub type HandlerResult = Result<Option<serde_json::Value>, JobQueueError>;
type BoxHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A user-supplied job handler. Boxed so `Manager::work` can accept any
/// `async fn(Vec<Job>) -> HandlerResult` (closures included).
pub type Handler = Arc<dyn Fn(Vec<Job>) -> BoxHandlerFuture + Send + Sync>;

/// Point-in-time bookkeeping a worker exposes to the manager for `wip`
/// snapshots and `off_work`/`stop` coordination.
#[derive(Debug)]
struct WorkerStatus {
    state: WorkerState,
    in_flight: Vec<Uuid>,
    created_on: DateTime<Utc>,
    last_fetched_on: Option<DateTime<Utc>>,
    last_job_started_on: Option<DateTime<Utc>>,
    last_job_ended_on: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_on: Option<DateTime<Utc>>,
}

/// A handle the manager keeps in its worker registry. Owns the
/// notification signal and the stop flag; the polling task itself runs
/// detached on the `tokio` runtime.
pub struct WorkerHandle {
    pub id: Uuid,
    pub name: String,
    notify: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    status: Arc<RwLock<WorkerStatus>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Request a graceful stop; the loop exits at its next safe point
    /// (before starting a new fetch).
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        if let Ok(mut status) = self.status.write() {
            if status.state != WorkerState::Stopped {
                status.state = WorkerState::Stopping;
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        self.status.read().expect("worker status lock poisoned").state
    }

    pub fn in_flight_ids(&self) -> Vec<Uuid> {
        self.status
            .read()
            .expect("worker status lock poisoned")
            .in_flight
            .clone()
    }

    /// Wait for the loop task to actually exit (used by `Manager::stop`).
    pub async fn join(self) {
        let _ = self.join.await;
    }

    pub fn snapshot(&self) -> WipSnapshot {
        let status = self.status.read().expect("worker status lock poisoned");
        WipSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: status.state,
            count: status.in_flight.len(),
            created_on: status.created_on,
            last_fetched_on: status.last_fetched_on,
            last_job_started_on: status.last_job_started_on,
            last_job_ended_on: status.last_job_ended_on,
            last_error: status.last_error.clone(),
            last_error_on: status.last_error_on,
        }
    }
}

/// Sentinel failure reason used when the manager fails in-flight jobs on
/// an ungraceful shutdown (`Manager::fail_wip`).
pub const SHUTDOWN_FAILURE_REASON: &str = "job queue shut down while active";

/// Spawn a worker's polling loop and return the registry handle for it.
pub fn spawn(
    id: Uuid,
    name: String,
    backend: Arc<dyn Backend>,
    options: WorkerOptions,
    handler: Handler,
    events: EventBus,
) -> WorkerHandle {
    let notify = Arc::new(Notify::new());
    let stopping = Arc::new(AtomicBool::new(false));
    let status = Arc::new(RwLock::new(WorkerStatus {
        state: WorkerState::Created,
        in_flight: Vec::new(),
        created_on: Utc::now(),
        last_fetched_on: None,
        last_job_started_on: None,
        last_job_ended_on: None,
        last_error: None,
        last_error_on: None,
    }));

    let loop_notify = notify.clone();
    let loop_stopping = stopping.clone();
    let loop_status = status.clone();
    let loop_name = name.clone();

    let join = tokio::spawn(run_loop(
        id,
        loop_name,
        backend,
        options,
        handler,
        events,
        loop_notify,
        loop_stopping,
        loop_status,
    ));

    WorkerHandle {
        id,
        name,
        notify,
        stopping,
        status,
        join,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    id: Uuid,
    name: String,
    backend: Arc<dyn Backend>,
    options: WorkerOptions,
    handler: Handler,
    events: EventBus,
    notify: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    status: Arc<RwLock<WorkerStatus>>,
) {
    {
        let mut s = status.write().expect("worker status lock poisoned");
        s.state = WorkerState::Active;
    }

    loop {
        if stopping.load(Ordering::SeqCst) {
            break;
        }

        // Step 1: sleep for `interval`, waking early on notify.
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = notify.notified() => {}
        }

        if stopping.load(Ordering::SeqCst) {
            break;
        }

        // Step 2: fetch a batch. Transport errors are swallowed into an
        // empty batch — fetch contention producing unique-index
        // collisions is the expected error class here.
        let fetch_opts = FetchOptions {
            batch_size: options.batch_size,
            priority: options.priority,
            include_metadata: options.include_metadata,
        };
        let batch = match backend.fetch_next_job(&name, fetch_opts).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(queue = %name, error = %err, "fetch failed, treating as empty batch");
                events.emit_error(err.to_string(), Some(name.clone()), Some(id));
                Vec::new()
            }
        };

        {
            let mut s = status.write().expect("worker status lock poisoned");
            s.last_fetched_on = Some(Utc::now());
        }

        // Step 3: nothing to do, loop back to sleeping.
        if batch.is_empty() {
            continue;
        }

        let ids: Vec<Uuid> = batch.iter().map(|j| j.id).collect();
        {
            let mut s = status.write().expect("worker status lock poisoned");
            s.in_flight = ids.clone();
            s.last_job_started_on = Some(Utc::now());
        }
        events.emit_wip(vec![snapshot_now(&id, &name, &status)]);

        // Step 4/5: race the handler against the batch's deadline.
        let deadline = batch
            .iter()
            .map(|j| j.expire_in_seconds.max(1))
            .max()
            .unwrap_or(1) as u64;
        let batch_len = batch.len();
        let handler_fut = handler(batch);
        let handle: JoinHandle<HandlerResult> = tokio::spawn(handler_fut);

        let outcome = tokio::select! {
            result = handle => Outcome::Handler(result),
            _ = tokio::time::sleep(StdDuration::from_secs(deadline)) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::TimedOut => {
                let elapsed_ms = deadline * 1000;
                let failure = FailureInfo::from_message(format!(
                    "handler execution exceeded {elapsed_ms}ms"
                ));
                if let Err(err) = backend.fail_jobs_by_id(&name, &ids, &failure).await {
                    tracing::error!(queue = %name, error = %err, "failed to record handler timeout");
                }
                events.emit_error(failure.message.clone(), Some(name.clone()), Some(id));
                record_error(&status, failure.message);
                // The timed-out handler task keeps running; its result,
                // once it resolves, is simply never read.
            }
            Outcome::Handler(Ok(Ok(output))) => {
                let output = if batch_len == 1 { output } else { None };
                if let Err(err) = backend.complete_jobs(&name, &ids, output).await {
                    tracing::error!(queue = %name, error = %err, "failed to record completion");
                    events.emit_error(err.to_string(), Some(name.clone()), Some(id));
                    record_error(&status, err.to_string());
                }
            }
            Outcome::Handler(Ok(Err(handler_err))) => {
                let failure = FailureInfo::from_queue_error(&handler_err);
                if let Err(err) = backend.fail_jobs_by_id(&name, &ids, &failure).await {
                    tracing::error!(queue = %name, error = %err, "failed to record handler error");
                }
                events.emit_error(failure.message.clone(), Some(name.clone()), Some(id));
                record_error(&status, failure.message);
            }
            Outcome::Handler(Err(join_err)) => {
                let failure = FailureInfo::from_message(format!("handler task panicked: {join_err}"));
                if let Err(err) = backend.fail_jobs_by_id(&name, &ids, &failure).await {
                    tracing::error!(queue = %name, error = %err, "failed to record handler panic");
                }
                events.emit_error(failure.message.clone(), Some(name.clone()), Some(id));
                record_error(&status, failure.message);
            }
        }

        {
            let mut s = status.write().expect("worker status lock poisoned");
            s.in_flight.clear();
            s.last_job_ended_on = Some(Utc::now());
        }
    }

    let mut s = status.write().expect("worker status lock poisoned");
    s.state = WorkerState::Stopped;
}

enum Outcome {
    Handler(Result<HandlerResult, tokio::task::JoinError>),
    TimedOut,
}

fn record_error(status: &RwLock<WorkerStatus>, message: String) {
    let mut s = status.write().expect("worker status lock poisoned");
    s.last_error = Some(message);
    s.last_error_on = Some(Utc::now());
}

fn snapshot_now(id: &Uuid, name: &str, status: &RwLock<WorkerStatus>) -> WipSnapshot {
    let s = status.read().expect("worker status lock poisoned");
    WipSnapshot {
        id: *id,
        name: name.to_string(),
        state: s.state,
        count: s.in_flight.len(),
        created_on: s.created_on,
        last_fetched_on: s.last_fetched_on,
        last_job_started_on: s.last_job_started_on,
        last_job_ended_on: s.last_job_ended_on,
        last_error: s.last_error.clone(),
        last_error_on: s.last_error_on,
    }
}
