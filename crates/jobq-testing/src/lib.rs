//! In-memory [`Backend`] used by `jobq-core`'s own worker/manager tests and
//! by downstream consumers that want to exercise the manager API without a
//! live Postgres instance.
//!
//! `FakeBackend` reproduces the unique-index semantics `jobq-postgres`
//! enforces at the database level (short/singleton/stately policies,
//! throttle/debounce buckets) with plain `Mutex`-guarded `Vec`s, so tests
//! written against it exercise the same collision behavior a real backend
//! would produce.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobq_core::{
    BatchResult, FailureInfo, FetchOptions, InsertJobOptions, Job, JobState, JobStore,
    JobQueueError, Policy, Queue, QueueOptions, QueueRegistry, SubscriptionStore,
    UpdateQueueOptions,
};
use uuid::Uuid;

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    jobs: HashMap<String, Vec<Job>>,
    archive: Vec<Job>,
    subscriptions: Vec<(String, String)>,
}

/// An in-memory stand-in for `jobq_postgres::PgBackend`.
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Test helper: snapshot every live job currently enqueued on `name`.
    pub fn jobs_snapshot(&self, name: &str) -> Vec<Job> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        state.jobs.get(name).cloned().unwrap_or_default()
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(name: &str) -> JobQueueError {
    JobQueueError::not_found(format!("queue '{name}' does not exist"))
}

fn normalize_output(output: Option<serde_json::Value>) -> Option<serde_json::Value> {
    match output {
        None | Some(serde_json::Value::Null) => None,
        Some(v @ serde_json::Value::Object(_)) => Some(v),
        Some(other) => Some(serde_json::json!({ "value": other })),
    }
}

fn singleton_bucket(now: DateTime<Utc>, window_seconds: i64, offset_seconds: i64) -> DateTime<Utc> {
    let total = now.timestamp() + offset_seconds;
    let bucket = if window_seconds > 0 {
        (total.div_euclid(window_seconds)) * window_seconds
    } else {
        total
    };
    DateTime::<Utc>::from_timestamp(bucket, 0).unwrap_or(now)
}

#[async_trait]
impl JobStore for FakeBackend {
    async fn insert_job(
        &self,
        name: &str,
        opts: InsertJobOptions,
    ) -> Result<Option<Uuid>, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let queue = state.queues.get(name).cloned().ok_or_else(|| not_found(name))?;
        let now = Utc::now();

        let singleton_on = opts
            .singleton_seconds
            .map(|window| singleton_bucket(now, window, opts.singleton_offset.unwrap_or(0)));

        let existing = state.jobs.entry(name.to_string()).or_default();

        let policy_conflict = match queue.policy {
            Policy::Standard => false,
            Policy::Short => existing.iter().any(|j| j.state == JobState::Created),
            // Singleton's unique index is predicated on `state = 'active'`,
            // and a freshly inserted job always starts `created` — it can
            // never collide with that index, so insertion is never blocked
            // here. The one-active-at-a-time invariant is enforced where it
            // actually applies: claiming, in `fetch_next_job`.
            Policy::Singleton => false,
            Policy::Stately => existing.iter().any(|j| j.state == JobState::Created),
        };
        if policy_conflict {
            return Ok(None);
        }

        if opts.singleton_key.is_some() || singleton_on.is_some() {
            let key = opts.singleton_key.clone().unwrap_or_default();
            let throttle_conflict = existing.iter().any(|j| {
                if j.state > JobState::Completed {
                    return false;
                }
                let same_key = j.singleton_key.clone().unwrap_or_default() == key;
                same_key && j.singleton_on == singleton_on
            });
            if throttle_conflict {
                return Ok(None);
            }
        }

        let id = opts.id.unwrap_or_else(Uuid::new_v4);
        let job = Job {
            id,
            name: name.to_string(),
            priority: opts.priority,
            data: opts.data,
            state: JobState::Created,
            retry_limit: opts.retry_limit.unwrap_or(queue.retry_limit),
            retry_count: 0,
            retry_delay: opts.retry_delay.unwrap_or(queue.retry_delay),
            retry_backoff: opts.retry_backoff.unwrap_or(queue.retry_backoff),
            start_after: opts.start_after,
            started_on: None,
            singleton_key: opts.singleton_key,
            singleton_on,
            expire_in_seconds: opts.expire_in_seconds.unwrap_or(queue.expire_in_seconds),
            created_on: now,
            completed_on: None,
            keep_until: opts
                .keep_until
                .unwrap_or(now + Duration::minutes(queue.retention_minutes as i64)),
            output: None,
            dead_letter: queue.dead_letter.clone(),
            policy: queue.policy,
        };
        existing.push(job);
        Ok(Some(id))
    }

    async fn fetch_next_job(
        &self,
        name: &str,
        opts: FetchOptions,
    ) -> Result<Vec<Job>, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let queue = state.queues.get(name).cloned().ok_or_else(|| not_found(name))?;
        let now = Utc::now();
        let list = state.jobs.entry(name.to_string()).or_default();

        let mut candidates: Vec<usize> = list
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                matches!(j.state, JobState::Created | JobState::Retry) && j.start_after <= now
            })
            .map(|(i, _)| i)
            .collect();

        if opts.priority {
            candidates.sort_by(|&a, &b| {
                list[b]
                    .priority
                    .cmp(&list[a].priority)
                    .then(list[a].created_on.cmp(&list[b].created_on))
            });
        } else {
            candidates.sort_by(|&a, &b| list[a].created_on.cmp(&list[b].created_on));
        }
        candidates.truncate(opts.batch_size.max(0) as usize);

        // Singleton/Stately cap the number of simultaneously `active` jobs
        // at one, the same invariant `jobq_postgres::plan::policy_index_statements`
        // enforces with a unique partial index. Claiming more candidates than
        // the policy allows aborts the whole activation rather than partially
        // claiming some of them, mirroring a unique-violation rolling back the
        // backend's batched `UPDATE` atomically.
        if matches!(queue.policy, Policy::Singleton | Policy::Stately) {
            let active_count = list.iter().filter(|j| j.state == JobState::Active).count();
            if active_count + candidates.len() > 1 {
                return Ok(Vec::new());
            }
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for idx in candidates {
            list[idx].state = JobState::Active;
            list[idx].started_on = Some(now);
            claimed.push(list[idx].clone());
        }
        Ok(claimed)
    }

    async fn complete_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<BatchResult, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let normalized = normalize_output(output);
        let mut affected = 0;
        for job in list.iter_mut() {
            if ids.contains(&job.id) && job.state == JobState::Active {
                job.state = JobState::Completed;
                job.completed_on = Some(Utc::now());
                job.output = normalized.clone();
                affected += 1;
            }
        }
        Ok(BatchResult {
            requested: ids.len(),
            affected,
        })
    }

    async fn fail_jobs_by_id(
        &self,
        name: &str,
        ids: &[Uuid],
        failure: &FailureInfo,
    ) -> Result<BatchResult, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let now = Utc::now();
        let mut affected = 0;
        let mut dead_letters: Vec<(String, serde_json::Value)> = Vec::new();

        for job in list.iter_mut() {
            if !ids.contains(&job.id) || job.state.is_terminal() {
                continue;
            }
            affected += 1;
            job.retry_count += 1;
            if job.retry_count < job.retry_limit {
                // `retry_delay * 2^retry_count * (1 + jitter)`, mirroring
                // `jobq_postgres::plan::fail_jobs_by_id`'s `random()` jitter
                // term so both backends spread out simultaneous retries.
                let delay_ms = if job.retry_backoff {
                    let base = job.retry_delay as f64 * 2f64.powi(job.retry_count);
                    (base * (1.0 + fastrand::f64()) * 1000.0) as i64
                } else {
                    job.retry_delay as i64 * 1000
                };
                job.start_after = now + Duration::milliseconds(delay_ms.max(0));
                job.state = JobState::Retry;
            } else {
                job.state = JobState::Failed;
                job.completed_on = Some(now);
                job.output = serde_json::to_value(failure).ok();
                if let Some(dead_letter) = job.dead_letter.clone() {
                    dead_letters.push((dead_letter, job.data.clone()));
                }
            }
        }
        drop(state);

        for (queue_name, data) in dead_letters {
            if let Err(err) = self.insert_job(&queue_name, InsertJobOptions::new(data)).await {
                tracing::warn!(
                    queue = %queue_name,
                    error = %err,
                    "dead letter queue rejected forwarded job"
                );
            }
        }

        Ok(BatchResult {
            requested: ids.len(),
            affected,
        })
    }

    async fn cancel_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let mut affected = 0;
        for job in list.iter_mut() {
            if ids.contains(&job.id) && !job.state.is_terminal() {
                job.state = JobState::Cancelled;
                job.completed_on = Some(Utc::now());
                affected += 1;
            }
        }
        Ok(BatchResult {
            requested: ids.len(),
            affected,
        })
    }

    async fn resume_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let mut affected = 0;
        for job in list.iter_mut() {
            if ids.contains(&job.id) && job.state.is_terminal() {
                job.state = JobState::Created;
                job.completed_on = None;
                job.output = None;
                job.started_on = None;
                affected += 1;
            }
        }
        Ok(BatchResult {
            requested: ids.len(),
            affected,
        })
    }

    async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<BatchResult, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let before = list.len();
        list.retain(|j| !ids.contains(&j.id));
        let affected = before - list.len();
        Ok(BatchResult {
            requested: ids.len(),
            affected,
        })
    }

    async fn get_job_by_id(
        &self,
        name: &str,
        id: Uuid,
        include_archive: bool,
    ) -> Result<Option<Job>, JobQueueError> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        if let Some(list) = state.jobs.get(name) {
            if let Some(job) = list.iter().find(|j| j.id == id) {
                return Ok(Some(job.clone()));
            }
        }
        if include_archive {
            return Ok(state
                .archive
                .iter()
                .find(|j| j.id == id && j.name == name)
                .cloned());
        }
        Ok(None)
    }

    async fn archive_terminal_jobs(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        let mut archived = Vec::new();
        list.retain(|j| {
            if j.state.is_terminal() && j.keep_until <= now {
                archived.push(j.clone());
                false
            } else {
                true
            }
        });
        let count = archived.len() as u64;
        state.archive.extend(archived);
        Ok(count)
    }
}

#[async_trait]
impl QueueRegistry for FakeBackend {
    async fn create_queue(&self, name: &str, opts: QueueOptions) -> Result<(), JobQueueError> {
        jobq_core::validate_queue_name(name)?;
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        if state.queues.contains_key(name) {
            return Err(JobQueueError::validation(format!(
                "queue '{name}' already exists"
            )));
        }
        state.queues.insert(
            name.to_string(),
            Queue {
                name: name.to_string(),
                policy: opts.policy,
                retry_limit: opts.retry_limit.unwrap_or(2),
                retry_delay: opts.retry_delay.unwrap_or(0),
                retry_backoff: opts.retry_backoff.unwrap_or(false),
                expire_in_seconds: opts.expire_in_seconds.unwrap_or(900),
                retention_minutes: opts.retention_minutes.unwrap_or(10_080),
                dead_letter: opts.dead_letter,
                created_on: Utc::now(),
            },
        );
        state.jobs.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn update_queue(
        &self,
        name: &str,
        opts: UpdateQueueOptions,
    ) -> Result<(), JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let queue = state.queues.get_mut(name).ok_or_else(|| not_found(name))?;
        if let Some(v) = opts.retry_limit {
            queue.retry_limit = v;
        }
        if let Some(v) = opts.retry_delay {
            queue.retry_delay = v;
        }
        if let Some(v) = opts.retry_backoff {
            queue.retry_backoff = v;
        }
        if let Some(v) = opts.expire_in_seconds {
            queue.expire_in_seconds = v;
        }
        if let Some(v) = opts.retention_minutes {
            queue.retention_minutes = v;
        }
        if let Some(v) = opts.dead_letter {
            queue.dead_letter = v;
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        if state.queues.remove(name).is_none() {
            return Err(not_found(name));
        }
        state.jobs.remove(name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get_mut(name).ok_or_else(|| not_found(name))?;
        list.retain(|j| j.state.is_terminal());
        Ok(())
    }

    async fn get_queue_size(
        &self,
        name: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<i64, JobQueueError> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        let list = state.jobs.get(name).ok_or_else(|| not_found(name))?;
        let count = list
            .iter()
            .filter(|j| !j.state.is_terminal() && before.map(|b| j.start_after < b).unwrap_or(true))
            .count();
        Ok(count as i64)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, JobQueueError> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        Ok(state.queues.get(name).cloned())
    }

    async fn get_queues(&self) -> Result<Vec<Queue>, JobQueueError> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        Ok(state.queues.values().cloned().collect())
    }
}

#[async_trait]
impl SubscriptionStore for FakeBackend {
    async fn subscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        let key = (event.to_string(), name.to_string());
        if !state.subscriptions.contains(&key) {
            state.subscriptions.push(key);
        }
        Ok(())
    }

    async fn unsubscribe(&self, event: &str, name: &str) -> Result<(), JobQueueError> {
        let mut state = self.state.lock().expect("fake backend lock poisoned");
        state
            .subscriptions
            .retain(|(e, n)| !(e == event && n == name));
        Ok(())
    }

    async fn get_queues_for_event(&self, event: &str) -> Result<Vec<String>, JobQueueError> {
        let state = self.state.lock().expect("fake backend lock poisoned");
        Ok(state
            .subscriptions
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, n)| n.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{FetchOptions, InsertJobOptions};

    #[tokio::test]
    async fn singleton_policy_rejects_second_active() {
        let backend = FakeBackend::new();
        backend
            .create_queue(
                "alerts",
                QueueOptions {
                    policy: Policy::Singleton,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        backend
            .insert_job("alerts", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();
        let first_claim = backend
            .fetch_next_job("alerts", FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(first_claim.len(), 1);

        let second = backend
            .insert_job("alerts", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();
        assert!(
            second.is_some(),
            "singleton only blocks a second active job, not a second insert"
        );

        let second_claim = backend
            .fetch_next_job("alerts", FetchOptions::default())
            .await
            .unwrap();
        assert!(
            second_claim.is_empty(),
            "a second job cannot become active while one is already active"
        );

        let snapshot = backend.jobs_snapshot("alerts");
        assert_eq!(
            snapshot.iter().filter(|j| j.state == JobState::Active).count(),
            1
        );
    }

    #[tokio::test]
    async fn singleton_policy_rejects_second_active_in_one_batch() {
        let backend = FakeBackend::new();
        backend
            .create_queue(
                "alerts-batch",
                QueueOptions {
                    policy: Policy::Singleton,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        backend
            .insert_job("alerts-batch", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();
        backend
            .insert_job("alerts-batch", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();

        let claimed = backend
            .fetch_next_job(
                "alerts-batch",
                FetchOptions {
                    batch_size: 2,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(
            claimed.is_empty(),
            "a batch that would activate two singleton jobs at once claims nothing"
        );
    }

    #[tokio::test]
    async fn short_policy_rejects_second_created() {
        let backend = FakeBackend::new();
        backend
            .create_queue(
                "reports",
                QueueOptions {
                    policy: Policy::Short,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = backend
            .insert_job("reports", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = backend
            .insert_job("reports", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fetch_claims_exclusively() {
        let backend = FakeBackend::new();
        backend
            .create_queue("work", QueueOptions::default())
            .await
            .unwrap();
        backend
            .insert_job("work", InsertJobOptions::new(serde_json::json!({})))
            .await
            .unwrap();

        let first = backend
            .fetch_next_job("work", FetchOptions::default())
            .await
            .unwrap();
        let second = backend
            .fetch_next_job("work", FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn fail_retries_then_dead_letters() {
        let backend = FakeBackend::new();
        backend
            .create_queue(
                "flaky-dlq",
                QueueOptions::default(),
            )
            .await
            .unwrap();
        backend
            .create_queue(
                "flaky",
                QueueOptions {
                    retry_limit: Some(2),
                    dead_letter: Some("flaky-dlq".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = backend
            .insert_job("flaky", InsertJobOptions::new(serde_json::json!({"n": 1})))
            .await
            .unwrap()
            .unwrap();

        backend
            .fetch_next_job("flaky", FetchOptions::default())
            .await
            .unwrap();
        backend
            .fail_jobs_by_id("flaky", &[id], &FailureInfo::from_message("boom"))
            .await
            .unwrap();
        let job = backend.get_job_by_id("flaky", id, false).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retry);

        let job = {
            let mut job = job;
            job.start_after = Utc::now() - Duration::seconds(1);
            job
        };
        // second failure should exceed retry_limit and dead-letter.
        backend
            .fail_jobs_by_id("flaky", &[job.id], &FailureInfo::from_message("boom again"))
            .await
            .unwrap();
        let dlq = backend.jobs_snapshot("flaky-dlq");
        assert_eq!(dlq.len(), 1);
    }
}
