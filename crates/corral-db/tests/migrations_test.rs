//! Integration tests for database migrations and connection pooling.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance (via testcontainers), runs migrations,
//! and drops it on completion so tests are fully isolated and idempotent.

use sqlx::Row;

use corral_db::pool;

use corral_test_utils::{create_test_db, drop_test_db};

/// Expected tables created by the migrations, in pg_tables order.
const EXPECTED_TABLES: &[&str] = &[
    "actions",
    "flows",
    "messages",
    "orchestrators",
    "roles",
    "task_history",
    "tasks",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (temp_pool, db_name) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list tables");

    let table_names: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();

    // Filter out the sqlx metadata table.
    let user_tables: Vec<&str> = table_names
        .iter()
        .filter(|t| !t.starts_with("_sqlx"))
        .copied()
        .collect();

    assert_eq!(
        user_tables, EXPECTED_TABLES,
        "migrations should create exactly the expected tables"
    );

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (temp_pool, db_name) = create_test_db().await;

    // create_test_db already ran migrations once; a second run should be a
    // no-op.
    pool::run_migrations(&temp_pool)
        .await
        .expect("second migration run should succeed (idempotent)");

    // Tables should still be present and empty.
    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) AS cnt FROM {table}");
        let row = sqlx::query(&query)
            .fetch_one(&temp_pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        let count: i64 = row.get("cnt");
        assert_eq!(count, 0, "table {table} should be empty after migrations");
    }

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn scope_index_exists_on_tasks() {
    let (temp_pool, db_name) = create_test_db().await;

    let indexes: Vec<(String,)> = sqlx::query_as(
        "SELECT indexname::text FROM pg_indexes \
         WHERE schemaname = 'public' AND tablename = 'tasks'",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list indexes");

    let names: Vec<&str> = indexes.iter().map(|(n,)| n.as_str()).collect();
    assert!(
        names.contains(&"idx_tasks_scope"),
        "tasks.scope must be indexed for visibility queries, got: {names:?}"
    );

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pool_creates_and_destroys_cleanly() {
    let (temp_pool, db_name) = create_test_db().await;

    // Verify pool is functional.
    let one: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(&temp_pool)
        .await
        .expect("pool should be usable");
    assert_eq!(one.0, 1);

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}
