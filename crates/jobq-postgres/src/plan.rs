//! Parameterized SQL text for every core operation. Pure string building —
//! no I/O, no pool reference — so each function is unit-tested by
//! asserting on the shape of the text it produces rather than against a
//! live database.

use jobq_core::Policy;

fn order_clause(priority: bool) -> &'static str {
    if priority {
        "priority DESC, created_on ASC"
    } else {
        "created_on ASC"
    }
}

pub fn insert_job(schema: &str) -> String {
    format!(
        "INSERT INTO {schema}.job \
            (name, id, priority, data, retry_limit, retry_delay, retry_backoff, \
             start_after, singleton_key, singleton_on, expire_in_seconds, keep_until, \
             dead_letter, policy) \
         SELECT \
            q.name, \
            COALESCE($2::uuid, gen_random_uuid()), \
            $3, \
            $4, \
            COALESCE($5, q.retry_limit), \
            COALESCE($6, q.retry_delay), \
            COALESCE($7, q.retry_backoff), \
            $8, \
            $9, \
            $10, \
            COALESCE($11, q.expire_in_seconds), \
            COALESCE($12, now() + make_interval(mins => q.retention_minutes)), \
            q.dead_letter, \
            q.policy \
         FROM {schema}.queue q \
         WHERE q.name = $1 \
         ON CONFLICT DO NOTHING \
         RETURNING id"
    )
}

pub fn fetch_next_job(schema: &str, priority: bool) -> String {
    let order_by = order_clause(priority);
    format!(
        "WITH claimable AS ( \
            SELECT id FROM {schema}.job \
            WHERE name = $1 AND state IN ('created', 'retry') AND start_after <= now() \
            ORDER BY {order_by} \
            LIMIT $2 \
            FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE {schema}.job \
         SET state = 'active', started_on = now() \
         WHERE name = $1 AND id IN (SELECT id FROM claimable) \
         RETURNING id, name, priority, data, state, retry_limit, retry_count, retry_delay, \
                   retry_backoff, start_after, started_on, singleton_key, singleton_on, \
                   expire_in_seconds, created_on, completed_on, keep_until, output, \
                   dead_letter, policy"
    )
}

pub fn complete_jobs(schema: &str) -> String {
    format!(
        "UPDATE {schema}.job \
         SET state = 'completed', completed_on = now(), output = $3 \
         WHERE name = $1 AND id = ANY($2) AND state = 'active'"
    )
}

/// `$3` binds the failure payload serialized as JSON; only persisted once a
/// row crosses into `failed`. Returns `dead_letter`/`data` for every row
/// that was dead-lettered by this call, so the caller can forward them.
///
/// Backoff delay is `retry_delay * 2^retry_count * (1 + jitter)`
/// with `jitter` drawn per-row from `random()` so a batch of
/// simultaneously-failing jobs doesn't all retry at the exact same instant.
pub fn fail_jobs_by_id(schema: &str) -> String {
    format!(
        "UPDATE {schema}.job \
         SET \
            retry_count = retry_count + 1, \
            state = CASE WHEN retry_count + 1 < retry_limit THEN 'retry' ELSE 'failed' END, \
            start_after = CASE WHEN retry_count + 1 < retry_limit THEN \
                now() + make_interval(secs => CASE WHEN retry_backoff \
                    THEN retry_delay * power(2, retry_count + 1) * (1 + random()) \
                    ELSE retry_delay END) \
                ELSE start_after END, \
            completed_on = CASE WHEN retry_count + 1 >= retry_limit THEN now() ELSE completed_on END, \
            output = CASE WHEN retry_count + 1 >= retry_limit THEN $3 ELSE output END \
         WHERE name = $1 AND id = ANY($2) AND state NOT IN ('completed', 'cancelled', 'failed') \
         RETURNING id, dead_letter, data, (state = 'failed') AS dead_lettered"
    )
}

pub fn cancel_jobs(schema: &str) -> String {
    format!(
        "UPDATE {schema}.job \
         SET state = 'cancelled', completed_on = now() \
         WHERE name = $1 AND id = ANY($2) AND state NOT IN ('completed', 'cancelled', 'failed')"
    )
}

pub fn resume_jobs(schema: &str) -> String {
    format!(
        "UPDATE {schema}.job \
         SET state = 'created', completed_on = NULL, output = NULL, started_on = NULL \
         WHERE name = $1 AND id = ANY($2) AND state IN ('completed', 'cancelled', 'failed')"
    )
}

pub fn delete_jobs(schema: &str) -> String {
    format!("DELETE FROM {schema}.job WHERE name = $1 AND id = ANY($2)")
}

fn policy_index_statements(schema: &str, name: &str, policy: Policy) -> Vec<String> {
    let partition = format!("{schema}.job_{name}");
    match policy {
        Policy::Standard => Vec::new(),
        Policy::Short => vec![format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS job_{name}_short_idx ON {partition} (name) \
             WHERE state = 'created'"
        )],
        Policy::Singleton => vec![format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS job_{name}_singleton_idx ON {partition} (name) \
             WHERE state = 'active'"
        )],
        Policy::Stately => vec![format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS job_{name}_stately_idx ON {partition} (name, state) \
             WHERE state IN ('created', 'retry', 'active')"
        )],
    }
}

/// Throttle/debounce uniqueness applies to every queue regardless of
/// policy, since `send_throttled`/`send_debounced` are callable on any
/// queue.
fn throttle_index_statements(schema: &str, name: &str) -> Vec<String> {
    let partition = format!("{schema}.job_{name}");
    vec![
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS job_{name}_throttle_key_idx ON {partition} \
             (name, singleton_key) \
             WHERE singleton_key IS NOT NULL AND singleton_on IS NULL \
               AND state IN ('created', 'retry', 'active', 'completed')"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS job_{name}_throttle_bucket_idx ON {partition} \
             (name, singleton_on, COALESCE(singleton_key, '')) \
             WHERE singleton_on IS NOT NULL \
               AND state IN ('created', 'retry', 'active', 'completed')"
        ),
    ]
}

/// DDL to materialize a queue: its partition of the `job` table, plus
/// every policy-specific and throttle/debounce partial unique index.
pub fn create_queue_ddl(schema: &str, name: &str, policy: Policy) -> Vec<String> {
    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {schema}.job_{name} PARTITION OF {schema}.job \
         FOR VALUES IN ('{name}')"
    )];
    statements.extend(policy_index_statements(schema, name, policy));
    statements.extend(throttle_index_statements(schema, name));
    statements
}

pub fn insert_queue(schema: &str) -> String {
    format!(
        "INSERT INTO {schema}.queue \
            (name, policy, retry_limit, retry_delay, retry_backoff, expire_in_seconds, \
             retention_minutes, dead_letter) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    )
}

pub fn update_queue(schema: &str) -> String {
    format!(
        "UPDATE {schema}.queue SET \
            retry_limit = COALESCE($2, retry_limit), \
            retry_delay = COALESCE($3, retry_delay), \
            retry_backoff = COALESCE($4, retry_backoff), \
            expire_in_seconds = COALESCE($5, expire_in_seconds), \
            retention_minutes = COALESCE($6, retention_minutes) \
         WHERE name = $1"
    )
}

/// `dead_letter` uses a two-valued sentinel since `UpdateQueueOptions`
/// distinguishes "leave unchanged" from "clear it" — callers bind `$2` as
/// the literal string, not wrapped in another `COALESCE`.
pub fn update_queue_dead_letter(schema: &str) -> String {
    format!("UPDATE {schema}.queue SET dead_letter = $2 WHERE name = $1")
}

pub fn delete_queue_ddl(schema: &str, name: &str) -> Vec<String> {
    vec![
        format!("DELETE FROM {schema}.queue WHERE name = '{name}'"),
        format!("DROP TABLE IF EXISTS {schema}.job_{name}"),
    ]
}

pub fn get_queues(schema: &str) -> String {
    format!(
        "SELECT name, policy, retry_limit, retry_delay, retry_backoff, expire_in_seconds, \
                retention_minutes, dead_letter, created_on \
         FROM {schema}.queue ORDER BY name"
    )
}

pub fn get_queue(schema: &str) -> String {
    format!(
        "SELECT name, policy, retry_limit, retry_delay, retry_backoff, expire_in_seconds, \
                retention_minutes, dead_letter, created_on \
         FROM {schema}.queue WHERE name = $1"
    )
}

pub fn get_queue_size(schema: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {schema}.job \
         WHERE name = $1 AND state NOT IN ('completed', 'cancelled', 'failed') \
           AND ($2::timestamptz IS NULL OR start_after < $2)"
    )
}

pub fn purge_queue(schema: &str) -> String {
    format!(
        "DELETE FROM {schema}.job \
         WHERE name = $1 AND state NOT IN ('completed', 'cancelled', 'failed')"
    )
}

pub fn subscribe(schema: &str) -> String {
    format!(
        "INSERT INTO {schema}.subscription (event, name) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING"
    )
}

pub fn unsubscribe(schema: &str) -> String {
    format!("DELETE FROM {schema}.subscription WHERE event = $1 AND name = $2")
}

pub fn get_queues_for_event(schema: &str) -> String {
    format!("SELECT name FROM {schema}.subscription WHERE event = $1")
}

pub fn get_job_by_id(schema: &str) -> String {
    format!(
        "SELECT id, name, priority, data, state, retry_limit, retry_count, retry_delay, \
                retry_backoff, start_after, started_on, singleton_key, singleton_on, \
                expire_in_seconds, created_on, completed_on, keep_until, output, \
                dead_letter, policy \
         FROM {schema}.job WHERE name = $1 AND id = $2"
    )
}

pub fn get_archived_job_by_id(schema: &str) -> String {
    format!(
        "SELECT id, name, priority, data, state, retry_limit, retry_count, retry_delay, \
                retry_backoff, start_after, started_on, singleton_key, singleton_on, \
                expire_in_seconds, created_on, completed_on, keep_until, output, \
                dead_letter, policy \
         FROM {schema}.archive WHERE name = $1 AND id = $2"
    )
}

/// Moves every terminal row whose retention window has elapsed into the
/// archive in one statement, `archived_on` stamped at the moment of the move.
pub fn archive_terminal_jobs(schema: &str) -> String {
    format!(
        "WITH moved AS ( \
            DELETE FROM {schema}.job \
            WHERE name = $1 AND state IN ('completed', 'cancelled', 'failed') \
              AND keep_until <= $2 \
            RETURNING id, name, priority, data, state, retry_limit, retry_count, retry_delay, \
                      retry_backoff, start_after, started_on, singleton_key, singleton_on, \
                      expire_in_seconds, created_on, completed_on, keep_until, output, \
                      dead_letter, policy \
         ) \
         INSERT INTO {schema}.archive \
         SELECT *, now() AS archived_on FROM moved"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_next_job_orders_by_priority_when_requested() {
        let sql = fetch_next_job("job_queue", true);
        assert!(sql.contains("priority DESC"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn fetch_next_job_orders_by_creation_when_priority_disabled() {
        let sql = fetch_next_job("job_queue", false);
        assert!(!sql.contains("priority DESC"));
        assert!(sql.contains("created_on ASC"));
    }

    #[test]
    fn create_queue_ddl_adds_singleton_index_only_for_singleton_policy() {
        let ddl = create_queue_ddl("job_queue", "alerts", Policy::Singleton);
        assert!(ddl.iter().any(|s| s.contains("singleton_idx")));
        assert!(!ddl.iter().any(|s| s.contains("short_idx")));
        assert!(!ddl.iter().any(|s| s.contains("stately_idx")));
    }

    #[test]
    fn create_queue_ddl_always_includes_throttle_indexes() {
        let ddl = create_queue_ddl("job_queue", "reports", Policy::Standard);
        assert!(ddl.iter().any(|s| s.contains("throttle_key_idx")));
        assert!(ddl.iter().any(|s| s.contains("throttle_bucket_idx")));
    }

    #[test]
    fn insert_job_resolves_defaults_from_queue_row() {
        let sql = insert_job("job_queue");
        assert!(sql.contains("COALESCE($5, q.retry_limit)"));
        assert!(sql.contains("FROM job_queue.queue q"));
    }

    #[test]
    fn fail_jobs_by_id_dead_letters_on_exhausted_retries() {
        let sql = fail_jobs_by_id("job_queue");
        assert!(sql.contains("retry_count + 1 < retry_limit"));
        assert!(sql.contains("dead_lettered"));
    }
}
