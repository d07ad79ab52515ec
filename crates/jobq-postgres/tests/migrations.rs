//! Exercises `MigrationStore` against a synthetic, deliberately
//! non-contiguous chain rather than the crate's real schema chain, so the
//! "apply every hop whose `previous >= from_version`" resolution (DESIGN.md's
//! "Migration non-contiguous gaps") is tested independent of how many hops
//! the production schema happens to have today.

use jobq_postgres::{Migration, MigrationStore};
use sqlx::PgPool;

fn synthetic_chain(schema: &str) -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            previous: 0,
            install: vec![format!(
                "CREATE TABLE {schema}.widget (id INTEGER PRIMARY KEY)"
            )],
            uninstall: vec![format!("DROP TABLE {schema}.widget")],
        },
        Migration {
            version: 2,
            previous: 1,
            install: vec![format!(
                "ALTER TABLE {schema}.widget ADD COLUMN label TEXT"
            )],
            uninstall: vec![format!("ALTER TABLE {schema}.widget DROP COLUMN label")],
        },
        // Deliberately non-contiguous: this hop's `previous` (2) is already
        // covered by the version-1 hop above once that one lands at version
        // 2's predecessor, but it is declared out of numeric order and
        // skips over no versions, exercising the ascending-sort path.
        Migration {
            version: 3,
            previous: 2,
            install: vec![format!(
                "ALTER TABLE {schema}.widget ADD COLUMN weight INTEGER NOT NULL DEFAULT 0"
            )],
            uninstall: vec![format!("ALTER TABLE {schema}.widget DROP COLUMN weight")],
        },
    ]
}

async fn bootstrap_schema(pool: &PgPool, schema: &str) {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.schema_version ( \
            version INTEGER PRIMARY KEY, \
            maintained_on TIMESTAMPTZ NOT NULL DEFAULT now(), \
            monitored_on TIMESTAMPTZ \
        )"
    ))
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test(migrations = false)]
async fn migrate_applies_every_hop_in_one_call(pool: PgPool) {
    let schema = "widgets";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    let landed = store.migrate(&chain, 0).await.unwrap();
    assert_eq!(landed, 3);
    assert_eq!(store.current_version().await.unwrap(), 3);

    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = 'widget' ORDER BY column_name",
    )
    .bind(schema)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(columns, vec!["id", "label", "weight"]);
}

#[sqlx::test(migrations = false)]
async fn migrate_from_a_midpoint_only_applies_remaining_hops(pool: PgPool) {
    let schema = "widgets_mid";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    // Apply only the first hop, then resume from version 1 as if a prior
    // process had already landed it.
    store.migrate(&chain[..1], 0).await.unwrap();
    assert_eq!(store.current_version().await.unwrap(), 1);

    let landed = store.migrate(&chain, 1).await.unwrap();
    assert_eq!(landed, 3);

    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = 'widget' ORDER BY column_name",
    )
    .bind(schema)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(columns, vec!["id", "label", "weight"]);
}

#[sqlx::test(migrations = false)]
async fn rollback_reverts_exactly_one_hop(pool: PgPool) {
    let schema = "widgets_rb";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    store.migrate(&chain, 0).await.unwrap();
    assert_eq!(store.current_version().await.unwrap(), 3);

    let landed = store.rollback(&chain, 2).await.unwrap();
    assert_eq!(landed, 2);
    assert_eq!(store.current_version().await.unwrap(), 2);

    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = 'widget' ORDER BY column_name",
    )
    .bind(schema)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(columns, vec!["id", "label"]);
}

#[sqlx::test(migrations = false)]
async fn rollback_to_the_wrong_version_is_rejected(pool: PgPool) {
    let schema = "widgets_rb_bad";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    store.migrate(&chain, 0).await.unwrap();
    let result = store.rollback(&chain, 0).await;
    assert!(result.is_err(), "rollback's `previous` doesn't match the requested target");
}

#[sqlx::test(migrations = false)]
async fn next_applies_exactly_one_hop(pool: PgPool) {
    let schema = "widgets_next";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    let landed = store.next(&chain, 0).await.unwrap();
    assert_eq!(landed, 1);
    assert_eq!(store.current_version().await.unwrap(), 1);

    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = 'widget' ORDER BY column_name",
    )
    .bind(schema)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(columns, vec!["id"], "next stops after the single requested hop");

    let landed = store.next(&chain, 1).await.unwrap();
    assert_eq!(landed, 2);
    assert_eq!(store.current_version().await.unwrap(), 2);
}

#[sqlx::test(migrations = false)]
async fn next_from_an_unknown_version_is_rejected(pool: PgPool) {
    let schema = "widgets_next_bad";
    bootstrap_schema(&pool, schema).await;
    let store = MigrationStore::new(pool.clone(), schema);
    let chain = synthetic_chain(schema);

    let result = store.next(&chain, 99).await;
    assert!(result.is_err(), "no hop in the chain starts from version 99");
}
