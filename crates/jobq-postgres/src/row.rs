//! Manual row -> domain-type mapping. `Job`/`Queue` live in `jobq-core`,
//! which has no `sqlx` dependency, so there is no `derive(FromRow)` to
//! reach for — each field is pulled off the row with its own
//! `Row::try_get` call.

use jobq_core::{JobQueueError, JobState, Job, Policy, Queue};
use sqlx::postgres::PgRow;
use sqlx::Row;

pub fn job_from_row(row: &PgRow) -> Result<Job, JobQueueError> {
    let state: String = row.try_get("state").map_err(JobQueueError::transport)?;
    let policy: String = row.try_get("policy").map_err(JobQueueError::transport)?;
    Ok(Job {
        id: row.try_get("id").map_err(JobQueueError::transport)?,
        name: row.try_get("name").map_err(JobQueueError::transport)?,
        priority: row.try_get("priority").map_err(JobQueueError::transport)?,
        data: row.try_get("data").map_err(JobQueueError::transport)?,
        state: JobState::parse(&state)?,
        retry_limit: row.try_get("retry_limit").map_err(JobQueueError::transport)?,
        retry_count: row.try_get("retry_count").map_err(JobQueueError::transport)?,
        retry_delay: row.try_get("retry_delay").map_err(JobQueueError::transport)?,
        retry_backoff: row
            .try_get("retry_backoff")
            .map_err(JobQueueError::transport)?,
        start_after: row.try_get("start_after").map_err(JobQueueError::transport)?,
        started_on: row.try_get("started_on").map_err(JobQueueError::transport)?,
        singleton_key: row
            .try_get("singleton_key")
            .map_err(JobQueueError::transport)?,
        singleton_on: row
            .try_get("singleton_on")
            .map_err(JobQueueError::transport)?,
        expire_in_seconds: row
            .try_get("expire_in_seconds")
            .map_err(JobQueueError::transport)?,
        created_on: row.try_get("created_on").map_err(JobQueueError::transport)?,
        completed_on: row
            .try_get("completed_on")
            .map_err(JobQueueError::transport)?,
        keep_until: row.try_get("keep_until").map_err(JobQueueError::transport)?,
        output: row.try_get("output").map_err(JobQueueError::transport)?,
        dead_letter: row
            .try_get("dead_letter")
            .map_err(JobQueueError::transport)?,
        policy: Policy::parse(&policy)?,
    })
}

pub fn queue_from_row(row: &PgRow) -> Result<Queue, JobQueueError> {
    let policy: String = row.try_get("policy").map_err(JobQueueError::transport)?;
    Ok(Queue {
        name: row.try_get("name").map_err(JobQueueError::transport)?,
        policy: Policy::parse(&policy)?,
        retry_limit: row.try_get("retry_limit").map_err(JobQueueError::transport)?,
        retry_delay: row.try_get("retry_delay").map_err(JobQueueError::transport)?,
        retry_backoff: row
            .try_get("retry_backoff")
            .map_err(JobQueueError::transport)?,
        expire_in_seconds: row
            .try_get("expire_in_seconds")
            .map_err(JobQueueError::transport)?,
        retention_minutes: row
            .try_get("retention_minutes")
            .map_err(JobQueueError::transport)?,
        dead_letter: row
            .try_get("dead_letter")
            .map_err(JobQueueError::transport)?,
        created_on: row.try_get("created_on").map_err(JobQueueError::transport)?,
    })
}
