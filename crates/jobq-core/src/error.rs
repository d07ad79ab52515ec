//! Error taxonomy for the job queue.
//!
//! Validation errors and not-found errors are local and synchronous;
//! transport/handler errors
//! flow up through the worker loop and are reported via `fail` before
//! being re-emitted as `Event::Error`. Unique-index conflicts on insert
//! are *not* represented here — they are a normal `Ok(None)` return from
//! `JobStore::insert_job`, never an `Err`.

use std::fmt;

/// Every error this crate can produce.
#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("migration version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },

    #[error("no migration hop found for version {version}")]
    MigrationNotFound { version: i32 },

    #[error("handler execution exceeded {elapsed_ms}ms")]
    HandlerTimeout { elapsed_ms: u64 },

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("worker is stopped")]
    Stopped,
}

impl JobQueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

/// A coarse, payload-free label safe to attach to metrics or log fields
/// without risking leaking job data through an error's `Display` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafeErrorCategory {
    Validation,
    NotFound,
    VersionMismatch,
    HandlerTimeout,
    HandlerError,
    Transport,
    Stopped,
}

impl fmt::Display for SafeErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::VersionMismatch => "version_mismatch",
            Self::HandlerTimeout => "handler_timeout",
            Self::HandlerError => "handler_error",
            Self::Transport => "transport",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Implemented by error types that can report a [`SafeErrorCategory`]
/// without exposing the underlying message.
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

impl Categorizable for JobQueueError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            Self::Validation(_) => SafeErrorCategory::Validation,
            Self::NotFound(_) => SafeErrorCategory::NotFound,
            Self::VersionMismatch { .. } => SafeErrorCategory::VersionMismatch,
            Self::MigrationNotFound { .. } => SafeErrorCategory::NotFound,
            Self::HandlerTimeout { .. } => SafeErrorCategory::HandlerTimeout,
            Self::HandlerError(_) => SafeErrorCategory::HandlerError,
            Self::Transport(_) => SafeErrorCategory::Transport,
            Self::Stopped => SafeErrorCategory::Stopped,
        }
    }
}

/// Outcome of a batch of independent operations where one failure must
/// not cancel the others (used by `Manager::publish`'s fan-out).
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(String, String)>,
}

impl<T> BatchOutcome<T> {
    pub fn is_fully_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_without_message() {
        let err = JobQueueError::validation("bad name");
        assert_eq!(err.category(), SafeErrorCategory::Validation);
        assert_eq!(err.category().to_string(), "validation");
    }

    #[test]
    fn batch_outcome_tracks_partial_failure() {
        let mut outcome: BatchOutcome<u32> = BatchOutcome::default();
        outcome.succeeded.push(1);
        outcome.failed.push(("q2".into(), "boom".into()));
        assert!(!outcome.is_fully_succeeded());
    }
}
