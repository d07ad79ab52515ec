//! Domain model: queues, jobs, and the state machine that governs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobQueueError;

/// Total order `Created < Retry < Active < Completed < Cancelled < Failed`.
///
/// Declaration order doubles as the derived `Ord` — every partial-index
/// predicate in `jobq-postgres` compares states using this ordering
/// (e.g. "state <= Active").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, JobQueueError> {
        match s {
            "created" => Ok(Self::Created),
            "retry" => Ok(Self::Retry),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(JobQueueError::validation(format!(
                "unknown job state '{other}'"
            ))),
        }
    }
}

/// Uniqueness discipline a queue enforces at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// No extra uniqueness: any number of jobs may be outstanding.
    Standard,
    /// At most one job in `created` at a time.
    Short,
    /// At most one job in `active` at a time.
    Singleton,
    /// At most one job per `(name, state)` for states `<= active`.
    Stately,
}

impl Default for Policy {
    fn default() -> Self {
        Self::Standard
    }
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Short => "short",
            Self::Singleton => "singleton",
            Self::Stately => "stately",
        }
    }

    pub fn parse(s: &str) -> Result<Self, JobQueueError> {
        match s {
            "standard" => Ok(Self::Standard),
            "short" => Ok(Self::Short),
            "singleton" => Ok(Self::Singleton),
            "stately" => Ok(Self::Stately),
            other => Err(JobQueueError::validation(format!(
                "unknown queue policy '{other}'"
            ))),
        }
    }
}

/// A unit of work, live in the partitioned `job` table or sealed in `archive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub data: serde_json::Value,
    pub state: JobState,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<DateTime<Utc>>,
    pub expire_in_seconds: i32,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub keep_until: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub dead_letter: Option<String>,
    pub policy: Policy,
}

/// A queue's configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub policy: Policy,
    pub retry_limit: i32,
    pub retry_delay: i32,
    pub retry_backoff: bool,
    pub expire_in_seconds: i32,
    pub retention_minutes: i32,
    pub dead_letter: Option<String>,
    pub created_on: DateTime<Utc>,
}

/// Options accepted by `QueueRegistry::create_queue`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub policy: Policy,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    pub expire_in_seconds: Option<i32>,
    pub retention_minutes: Option<i32>,
    pub dead_letter: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            policy: Policy::Standard,
            retry_limit: None,
            retry_delay: None,
            retry_backoff: None,
            expire_in_seconds: None,
            retention_minutes: None,
            dead_letter: None,
        }
    }
}

/// Mutable fields accepted by `QueueRegistry::update_queue`. A field left
/// `None` is left unchanged; `dead_letter: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdateQueueOptions {
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    pub expire_in_seconds: Option<i32>,
    pub retention_minutes: Option<i32>,
    pub dead_letter: Option<Option<String>>,
}

/// Low-level insert parameters consumed by `JobStore::insert_job`. Built by
/// `Manager`'s `send*` family from the higher-level [`SendOptions`].
#[derive(Debug, Clone)]
pub struct InsertJobOptions {
    pub id: Option<Uuid>,
    pub data: serde_json::Value,
    pub priority: i32,
    pub start_after: DateTime<Utc>,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<i64>,
    pub singleton_offset: Option<i64>,
    pub expire_in_seconds: Option<i32>,
    pub keep_until: Option<DateTime<Utc>>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
}

impl InsertJobOptions {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            id: None,
            data,
            priority: 0,
            start_after: Utc::now(),
            singleton_key: None,
            singleton_seconds: None,
            singleton_offset: None,
            expire_in_seconds: None,
            keep_until: None,
            retry_limit: None,
            retry_delay: None,
            retry_backoff: None,
        }
    }
}

/// High-level send options exposed on `Manager::send`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub id: Option<Uuid>,
    pub priority: i32,
    pub expire_in_seconds: Option<i32>,
    pub keep_until: Option<DateTime<Utc>>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
}

/// Options accepted by `JobStore::fetch_next_job`.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: i64,
    pub priority: bool,
    pub include_metadata: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            priority: true,
            include_metadata: false,
        }
    }
}

/// Result of a state-transition operation affecting zero or more rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub requested: usize,
    pub affected: usize,
}

/// A job's failure, serialized the way a thrown handler error is recorded
/// against the row (`output`/`error_message`-equivalent payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub name: String,
    pub stack: Option<String>,
    pub cause: Option<Box<FailureInfo>>,
}

impl FailureInfo {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: "Error".to_string(),
            stack: capture_stack(),
            cause: None,
        }
    }

    pub fn from_queue_error(err: &JobQueueError) -> Self {
        let mut info = Self {
            message: err.to_string(),
            name: variant_name(err).to_string(),
            stack: capture_stack(),
            cause: None,
        };
        if let JobQueueError::Transport(source) = err {
            info.cause = Some(Box::new(Self {
                message: source.to_string(),
                name: "Transport".to_string(),
                stack: None,
                cause: None,
            }));
        }
        info
    }
}

fn variant_name(err: &JobQueueError) -> &'static str {
    match err {
        JobQueueError::Validation(_) => "Validation",
        JobQueueError::NotFound(_) => "NotFound",
        JobQueueError::VersionMismatch { .. } => "VersionMismatch",
        JobQueueError::MigrationNotFound { .. } => "MigrationNotFound",
        JobQueueError::HandlerTimeout { .. } => "HandlerTimeout",
        JobQueueError::HandlerError(_) => "HandlerError",
        JobQueueError::Transport(_) => "Transport",
        JobQueueError::Stopped => "Stopped",
    }
}

fn capture_stack() -> Option<String> {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        return None;
    }
    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        Some(backtrace.to_string())
    } else {
        None
    }
}

/// Queue name validity: non-empty, `[A-Za-z0-9_-]+`, not prefixed by the
/// internally-reserved `__`.
pub fn validate_queue_name(name: &str) -> Result<(), JobQueueError> {
    if name.is_empty() {
        return Err(JobQueueError::validation("queue name must not be empty"));
    }
    if name.starts_with("__") {
        return Err(JobQueueError::validation(format!(
            "queue name '{name}' uses the reserved '__' prefix"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(JobQueueError::validation(format!(
            "queue name '{name}' must match [A-Za-z0-9_-]+"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_total() {
        assert!(JobState::Created < JobState::Retry);
        assert!(JobState::Retry < JobState::Active);
        assert!(JobState::Active < JobState::Completed);
        assert!(JobState::Completed < JobState::Cancelled);
        assert!(JobState::Cancelled < JobState::Failed);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Created,
            JobState::Retry,
            JobState::Active,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("bogus").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Retry.is_terminal());
    }

    #[test]
    fn rejects_reserved_prefix() {
        assert!(validate_queue_name("__internal").is_err());
    }

    #[test]
    fn rejects_bad_characters() {
        assert!(validate_queue_name("has a space").is_err());
        assert!(validate_queue_name("has.dot").is_err());
    }

    #[test]
    fn accepts_normal_names() {
        assert!(validate_queue_name("email-send_v2").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_queue_name("").is_err());
    }
}
