//! Observability event bus: the `error`/`wip` streams embedders subscribe
//! to. Not to be confused with the job-fan-out pub/sub in `Manager::publish`
//! which forwards application events onto subscribed
//! queues — this bus only carries in-process notifications about the
//! manager's own health.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::worker::WorkerState;

/// Minimum gap between two `wip` emissions on a single bus.
const WIP_THROTTLE: Duration = Duration::from_secs(2);

/// A point-in-time snapshot of one worker, as carried by `Event::Wip`.
#[derive(Debug, Clone)]
pub struct WipSnapshot {
    pub id: Uuid,
    pub name: String,
    pub state: WorkerState,
    pub count: usize,
    pub created_on: DateTime<Utc>,
    pub last_fetched_on: Option<DateTime<Utc>>,
    pub last_job_started_on: Option<DateTime<Utc>>,
    pub last_job_ended_on: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_on: Option<DateTime<Utc>>,
}

/// Events the manager publishes for observability.
#[derive(Debug, Clone)]
pub enum Event {
    Error {
        message: String,
        queue: Option<String>,
        worker: Option<Uuid>,
    },
    Wip(Vec<WipSnapshot>),
}

/// Broadcast hub for [`Event`]s. Cheap to clone; every subscriber gets its
/// own receiver and lagging subscribers simply miss events rather than
/// blocking the manager.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    last_wip_emit: std::sync::Arc<Mutex<Option<Instant>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            last_wip_emit: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> EventTap {
        EventTap(self.sender.subscribe())
    }

    pub fn emit_error(&self, message: impl Into<String>, queue: Option<String>, worker: Option<Uuid>) {
        let _ = self.sender.send(Event::Error {
            message: message.into(),
            queue,
            worker,
        });
    }

    /// Emit a `wip` snapshot, rate-limited to at most one per two seconds.
    pub fn emit_wip(&self, snapshots: Vec<WipSnapshot>) {
        let mut guard = self.last_wip_emit.lock().expect("wip throttle mutex poisoned");
        let now = Instant::now();
        let should_emit = match *guard {
            Some(last) => now.duration_since(last) >= WIP_THROTTLE,
            None => true,
        };
        if should_emit {
            *guard = Some(now);
            let _ = self.sender.send(Event::Wip(snapshots));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription handle returned by `EventBus::subscribe`.
pub struct EventTap(broadcast::Receiver<Event>);

impl EventTap {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.0.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
