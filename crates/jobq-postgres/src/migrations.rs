//! Linear schema evolution under a session-level advisory lock.
//!
//! A `Migration` is a single forward/backward hop; the installed chain is
//! discovered by following `previous -> version` links rather than by a
//! flat numbered list, so `migrate` can apply a non-contiguous run of hops
//! in one call.

use jobq_core::JobQueueError;
use sqlx::PgPool;

/// One schema hop. `install`/`uninstall` are one complete statement per
/// entry — deliberately not a single concatenated string, so a missing
/// separator between two statements can't silently merge them.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i32,
    pub previous: i32,
    pub install: Vec<String>,
    pub uninstall: Vec<String>,
}

/// The chain this crate ships. `schema` is interpolated into the DDL
/// rather than bound as a parameter — identifiers can't be bind
/// parameters in Postgres. The schema name is a deployment-time
/// configuration value, not user input, the same trust boundary
/// `jobq_core::validate_queue_name` draws around queue names.
pub fn chain(schema: &str) -> Vec<Migration> {
    vec![Migration {
        version: 1,
        previous: 0,
        install: vec![
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            "CREATE EXTENSION IF NOT EXISTS pgcrypto".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.schema_version ( \
                    version INTEGER PRIMARY KEY, \
                    maintained_on TIMESTAMPTZ NOT NULL DEFAULT now(), \
                    monitored_on TIMESTAMPTZ \
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.queue ( \
                    name TEXT PRIMARY KEY, \
                    policy TEXT NOT NULL DEFAULT 'standard', \
                    retry_limit INTEGER NOT NULL DEFAULT 2, \
                    retry_delay INTEGER NOT NULL DEFAULT 0, \
                    retry_backoff BOOLEAN NOT NULL DEFAULT false, \
                    expire_in_seconds INTEGER NOT NULL DEFAULT 900, \
                    retention_minutes INTEGER NOT NULL DEFAULT 10080, \
                    dead_letter TEXT, \
                    created_on TIMESTAMPTZ NOT NULL DEFAULT now() \
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.job ( \
                    name TEXT NOT NULL REFERENCES {schema}.queue (name), \
                    id UUID NOT NULL DEFAULT gen_random_uuid(), \
                    priority INTEGER NOT NULL DEFAULT 0, \
                    data JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                    state TEXT NOT NULL DEFAULT 'created' \
                        CHECK (state IN ('created', 'retry', 'active', 'completed', 'cancelled', 'failed')), \
                    retry_limit INTEGER NOT NULL DEFAULT 2, \
                    retry_count INTEGER NOT NULL DEFAULT 0, \
                    retry_delay INTEGER NOT NULL DEFAULT 0, \
                    retry_backoff BOOLEAN NOT NULL DEFAULT false, \
                    start_after TIMESTAMPTZ NOT NULL DEFAULT now(), \
                    started_on TIMESTAMPTZ, \
                    singleton_key TEXT, \
                    singleton_on TIMESTAMPTZ, \
                    expire_in_seconds INTEGER NOT NULL DEFAULT 900, \
                    created_on TIMESTAMPTZ NOT NULL DEFAULT now(), \
                    completed_on TIMESTAMPTZ, \
                    keep_until TIMESTAMPTZ NOT NULL DEFAULT (now() + interval '14 days'), \
                    output JSONB, \
                    dead_letter TEXT, \
                    policy TEXT NOT NULL DEFAULT 'standard', \
                    PRIMARY KEY (name, id) \
                ) PARTITION BY LIST (name)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.archive ( \
                    LIKE {schema}.job INCLUDING DEFAULTS, \
                    archived_on TIMESTAMPTZ NOT NULL DEFAULT now(), \
                    PRIMARY KEY (name, id) \
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {schema}.subscription ( \
                    event TEXT NOT NULL, \
                    name TEXT NOT NULL, \
                    PRIMARY KEY (event, name) \
                )"
            ),
        ],
        uninstall: vec![
            format!("DROP TABLE IF EXISTS {schema}.subscription"),
            format!("DROP TABLE IF EXISTS {schema}.archive"),
            format!("DROP TABLE IF EXISTS {schema}.job"),
            format!("DROP TABLE IF EXISTS {schema}.queue"),
            format!("DROP TABLE IF EXISTS {schema}.schema_version"),
        ],
    }]
}

/// Applies/rolls back hops from [`chain`] against a live database, guarded
/// by `pg_advisory_xact_lock` so concurrent migrators serialize rather
/// than race.
pub struct MigrationStore {
    pool: PgPool,
    schema: String,
}

impl MigrationStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// A stable `djb2`-derived lock key for `pg_advisory_xact_lock`, so
    /// migrators targeting different schemas never contend with each
    /// other.
    fn lock_key(&self) -> i64 {
        let mut hash: i64 = 5381;
        for byte in self.schema.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(byte as i64);
        }
        hash
    }

    /// The highest version recorded in `schema_version`, or `0` if the
    /// schema hasn't been created yet.
    pub async fn current_version(&self) -> Result<i32, JobQueueError> {
        let sql = format!(
            "SELECT version FROM {}.schema_version ORDER BY version DESC LIMIT 1",
            self.schema
        );
        match sqlx::query_scalar::<_, i32>(&sql)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(version) => Ok(version.unwrap_or(0)),
            Err(sqlx::Error::Database(db_err))
                if matches!(db_err.code().as_deref(), Some("42P01") | Some("3F000")) =>
            {
                Ok(0)
            }
            Err(err) => Err(JobQueueError::transport(err)),
        }
    }

    /// Applies exactly the hop whose `previous` equals `from_version` — the
    /// single-hop counterpart to `migrate`'s "apply every applicable hop"
    /// plan, wrapped in its own advisory-locked transaction. Errs with
    /// `MigrationNotFound` if no hop starts from `from_version`.
    pub async fn next(&self, chain: &[Migration], from_version: i32) -> Result<i32, JobQueueError> {
        let migration = chain
            .iter()
            .find(|m| m.previous == from_version)
            .ok_or(JobQueueError::MigrationNotFound {
                version: from_version,
            })?;

        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.lock_key())
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        for statement in &migration.install {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
        }
        let bump = format!(
            "INSERT INTO {}.schema_version (version, maintained_on) VALUES ($1, now()) \
             ON CONFLICT (version) DO UPDATE SET maintained_on = now()",
            self.schema
        );
        sqlx::query(&bump)
            .bind(migration.version)
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(migration.version)
    }

    /// Locate the hop that installed `version`, for rolling it back.
    pub fn rollback_hop<'a>(&self, chain: &'a [Migration], version: i32) -> Option<&'a Migration> {
        chain.iter().find(|m| m.version == version)
    }

    /// Applies every hop whose `previous >= from_version`, ascending by
    /// `version`, inside one advisory-locked transaction per hop boundary
    /// check. Non-contiguous gaps are applied in full — see DESIGN.md's
    /// "Migration non-contiguous gaps" resolution.
    pub async fn migrate(&self, chain: &[Migration], from_version: i32) -> Result<i32, JobQueueError> {
        let mut applicable: Vec<&Migration> =
            chain.iter().filter(|m| m.previous >= from_version).collect();
        applicable.sort_by_key(|m| m.version);
        if applicable.is_empty() {
            return Ok(from_version);
        }

        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.lock_key())
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        let mut version = from_version;
        for migration in applicable {
            if migration.previous != version {
                return Err(JobQueueError::VersionMismatch {
                    expected: migration.previous,
                    found: version,
                });
            }
            for statement in &migration.install {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(JobQueueError::transport)?;
            }
            let bump = format!(
                "INSERT INTO {}.schema_version (version, maintained_on) VALUES ($1, now()) \
                 ON CONFLICT (version) DO UPDATE SET maintained_on = now()",
                self.schema
            );
            sqlx::query(&bump)
                .bind(migration.version)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
            version = migration.version;
        }

        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(version)
    }

    /// Rolls back exactly one hop from the currently recorded version.
    pub async fn rollback(&self, chain: &[Migration], to_version: i32) -> Result<i32, JobQueueError> {
        let current = self.current_version().await?;
        let migration = self
            .rollback_hop(chain, current)
            .ok_or(JobQueueError::MigrationNotFound { version: current })?;
        if migration.previous != to_version {
            return Err(JobQueueError::MigrationNotFound { version: to_version });
        }

        let mut tx = self.pool.begin().await.map_err(JobQueueError::transport)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.lock_key())
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        for statement in &migration.uninstall {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(JobQueueError::transport)?;
        }
        let forget = format!("DELETE FROM {}.schema_version WHERE version = $1", self.schema);
        sqlx::query(&forget)
            .bind(migration.version)
            .execute(&mut *tx)
            .await
            .map_err(JobQueueError::transport)?;

        tx.commit().await.map_err(JobQueueError::transport)?;
        Ok(migration.previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_starts_from_zero() {
        let migrations = chain("job_queue");
        assert_eq!(migrations[0].previous, 0);
        assert_eq!(migrations[0].version, 1);
    }

    #[test]
    fn install_statements_are_one_per_entry() {
        for migration in chain("job_queue") {
            for statement in &migration.install {
                assert_eq!(
                    statement.matches("CREATE").count() + statement.matches("DROP").count(),
                    1,
                    "each install entry should be exactly one DDL statement"
                );
            }
        }
    }

    #[test]
    fn lock_key_is_stable_for_same_schema() {
        let pool_a = MigrationStore {
            pool: unreachable_pool(),
            schema: "job_queue".to_string(),
        };
        let pool_b = MigrationStore {
            pool: unreachable_pool(),
            schema: "job_queue".to_string(),
        };
        assert_eq!(pool_a.lock_key(), pool_b.lock_key());
    }

    fn unreachable_pool() -> PgPool {
        // `PgPool` is cheap to construct lazily without connecting; this
        // exists purely so the struct literal above type-checks for a
        // pure-computation test that never executes a query.
        PgPool::connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction never touches the network")
    }
}
