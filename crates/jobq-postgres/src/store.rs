//! The concrete backend. `PgBackend` implements `JobStore` +
//! `QueueRegistry` + `SubscriptionStore` against a `PgPool`, claiming rows
//! with `FOR UPDATE SKIP LOCKED` and enforcing queue-policy uniqueness
//! through the partition's unique partial indexes rather than an
//! application-side lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{
    BatchResult, FailureInfo, FetchOptions, InsertJobOptions, Job, JobQueueError, JobStore, Queue,
    QueueOptions, QueueRegistry, SubscriptionStore, UpdateQueueOptions,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::migrations::MigrationStore;
use crate::plan;
use crate::row::{job_from_row, queue_from_row};

/// Mirrors `jobq-testing`'s bucket arithmetic so throttle/debounce windows
/// behave identically against the fake and the real backend.
fn singleton_bucket(now: DateTime<Utc>, window_seconds: i64, offset_seconds: i64) -> DateTime<Utc> {
    let total = now.timestamp() + offset_seconds;
    let bucket = if window_seconds > 0 {
        (total.div_euclid(window_seconds)) * window_seconds
    } else {
        total
    };
    DateTime::<Utc>::from_timestamp(bucket, 0).unwrap_or(now)
}

/// PostgreSQL-backed [`jobq_core::Backend`]. Cheap to clone — `PgPool` is
/// itself a connection-pool handle.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    schema: String,
}

impl PgBackend {
    /// Construct a backend against an already-migrated schema. Call
    /// [`PgBackend::migrate`] first on a fresh database.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Run every migration hop needed to bring this schema up to date.
    /// Idempotent: safe to call on every process startup.
    pub async fn migrate(&self) -> Result<i32, JobQueueError> {
        let store = MigrationStore::new(self.pool.clone(), self.schema.clone());
        let current = store.current_version().await?;
        let chain = crate::migrations::chain(&self.schema);
        store.migrate(&chain, current).await
    }
}

#[async_trait]
impl JobStore for PgBackend {
    async fn insert_job(
        &self,
        name: &str,
        opts: InsertJobOptions,
    ) -> Result<Option<Uuid>, JobQueueError> {
        let now = Utc::now();
        let singleton_on = opts
            .singleton_seconds
            .map(|window| singleton_bucket(now, window, opts.singleton_offset.unwrap_or(0)));

        let sql = plan::insert_job(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(opts.id)
            .bind(opts.priority)
            .bind(&opts.data)
            .bind(opts.retry_limit)
            .bind(opts.retry_delay)
            .bind(opts.retry_backoff)
            .bind(opts.start_after)
            .bind(&opts.singleton_key)
            .bind(singleton_on)
            .bind(opts.expire_in_seconds)
            .bind(opts.keep_until)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => Ok(Some(row.try_get("id").map_err(JobQueueError::transport)?)),
            Ok(None) => Ok(None),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Ok(None)
            }
            Err(err) => Err(JobQueueError::transport(err)),
        }
    }

    async fn fetch_next_job(
        &self,
        name: &str,
        opts: FetchOptions,
    ) -> Result<Vec<Job>, JobQueueError> {
        let sql = plan::fetch_next_job(&self.schema, opts.priority);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(opts.batch_size)
            .fetch_all(&self.pool)
            .await;

        // `fetch_next_job`'s `UPDATE ... WHERE id IN (claimable)` activates
        // every claimed row in one statement; if a policy's unique partial
        // index (singleton/stately) rejects one of them, Postgres aborts the
        // whole statement and none of the batch is actually claimed. That's
        // a normal claim collision, not a transport failure — same as
        // `insert_job`'s 23505 handling above.
        let rows = match result {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(JobQueueError::transport(err)),
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn complete_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<BatchResult, JobQueueError> {
        let sql = plan::complete_jobs(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(ids)
            .bind(normalize_output(output))
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(BatchResult {
            requested: ids.len(),
            affected: result.rows_affected() as usize,
        })
    }

    async fn fail_jobs_by_id(
        &self,
        name: &str,
        ids: &[Uuid],
        failure: &FailureInfo,
    ) -> Result<BatchResult, JobQueueError> {
        let sql = plan::fail_jobs_by_id(&self.schema);
        let payload = serde_json::to_value(failure).map_err(JobQueueError::transport)?;
        let rows = sqlx::query(&sql)
            .bind(name)
            .bind(ids)
            .bind(payload)
            .fetch_all(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;

        for row in &rows {
            let dead_lettered: bool = row
                .try_get("dead_lettered")
                .map_err(JobQueueError::transport)?;
            if !dead_lettered {
                continue;
            }
            let dead_letter: Option<String> =
                row.try_get("dead_letter").map_err(JobQueueError::transport)?;
            if let Some(queue_name) = dead_letter {
                let data: serde_json::Value =
                    row.try_get("data").map_err(JobQueueError::transport)?;
                if let Err(err) = self
                    .insert_job(&queue_name, InsertJobOptions::new(data))
                    .await
                {
                    tracing::warn!(
                        queue = %queue_name,
                        error = %err,
                        "dead letter queue rejected forwarded job"
                    );
                }
            }
        }

        Ok(BatchResult {
            requested: ids.len(),
            affected: rows.len(),
        })
    }

    async fn cancel_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let sql = plan::cancel_jobs(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(BatchResult {
            requested: ids.len(),
            affected: result.rows_affected() as usize,
        })
    }

    async fn resume_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let sql = plan::resume_jobs(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(BatchResult {
            requested: ids.len(),
            affected: result.rows_affected() as usize,
        })
    }

    async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let sql = plan::delete_jobs(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(BatchResult {
            requested: ids.len(),
            affected: result.rows_affected() as usize,
        })
    }

    async fn get_job_by_id(
        &self,
        name: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>, JobQueueError> {
        let sql = plan::get_job_by_id(&self.schema);
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        if let Some(row) = row {
            return Ok(Some(job_from_row(&row)?));
        }
        if !include_archive {
            return Ok(None);
        }
        let sql = plan::get_archived_job_by_id(&self.schema);
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn archive_terminal_jobs(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        let sql = plan::archive_terminal_jobs(&self.schema);
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(result.rows_affected())
    }
}

fn normalize_output(output: Option<serde_json::Value>) -> Option<serde_json::Value> {
    match output {
        None | Some(serde_json::Value::Null) => None,
        Some(v @ serde_json::Value::Object(_)) => Some(v),
        Some(other) => Some(serde_json::json!({ "value": other })),
    }
}

#[async_trait]
impl QueueRegistry for PgBackend {
    async fn create_queue(&self, name: &str, opts: QueueOptions) -> Result<(), JobQueueError> {
        jobq_core::validate_queue_name(name)?;
        if let Some(dead_letter) = &opts.dead_letter {
            jobq_core::validate_queue_name(dead_letter)?;
        }

        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        sqlx::query(&plan::insert_queue(&self.schema))
            .bind(name)
            .bind(opts.policy.as_str())
            .bind(opts.retry_limit.unwrap_or(2))
            .bind(opts.retry_delay.unwrap_or(0))
            .bind(opts.retry_backoff.unwrap_or(false))
            .bind(opts.expire_in_seconds.unwrap_or(900))
            .bind(opts.retention_minutes.unwrap_or(10_080))
            .bind(&opts.dead_letter)
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        for statement in plan::create_queue_ddl(&self.schema, name, opts.policy) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
        }

        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn update_queue(
        &self,
        name: &str,
        opts: UpdateQueueOptions,
    ) -> Result<(), JobQueueError> {
        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        sqlx::query(&plan::update_queue(&self.schema))
            .bind(name)
            .bind(opts.retry_limit)
            .bind(opts.retry_delay)
            .bind(opts.retry_backoff)
            .bind(opts.expire_in_seconds)
            .bind(opts.retention_minutes)
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        if let Some(dead_letter) = opts.dead_letter {
            if let Some(queue) = &dead_letter {
                jobq_core::validate_queue_name(queue)?;
            }
            sqlx::query(&plan::update_queue_dead_letter(&self.schema))
                .bind(name)
                .bind(dead_letter)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
        }

        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), JobQueueError> {
        jobq_core::validate_queue_name(name)?;
        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        for statement in plan::delete_queue_ddl(&self.schema, name) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
        }
        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), JobQueueError> {
        sqlx::query(&plan::purge_queue(&self.schema))
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn get_queue_size(
        &self,
        name: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<i64, JobQueueError> {
        let row = sqlx::query(&plan::get_queue_size(&self.schema))
            .bind(name)
            .bind(before)
            .fetch_one(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        row.try_get::<i64, _>(0).map_err(JobQueueError::transport)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, JobQueueError> {
        let row = sqlx::query(&plan::get_queue(&self.schema))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn get_queues(&self) -> Result<Vec<Queue>, JobQueueError> {
        let rows = sqlx::query(&plan::get_queues(&self.schema))
            .fetch_all(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        rows.iter().map(queue_from_row).collect()
    }
}

#[async_trait]
impl SubscriptionStore for PgBackend {
    async fn subscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        sqlx::query(&plan::subscribe(&self.schema))
            .bind(event)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn unsubscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        sqlx::query(&plan::unsubscribe(&self.schema))
            .bind(event)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        Ok(())
    }

    async fn get_queues_for_event(&self, event: &str) -> Result<Vec<String>, JobQueueError> {
        let rows = sqlx::query(&plan::get_queues_for_event(&self.schema))
            .bind(event)
            .fetch_all(&self.pool)
            .await
            .map_err(JobQueueError::transport)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(JobQueueError::transport))
            .collect()
    }
}
