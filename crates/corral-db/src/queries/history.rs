//! Database query functions for the `task_history` journal.
//!
//! History is append-only and best-effort: rows are written after the
//! authoritative task update commits, and a missing row never invalidates
//! task state. Rows cascade away with their task.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{TaskEvent, TaskHistoryEntry};

/// Parameters for appending a history row.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub task_id: String,
    pub event: TaskEvent,
    pub agent: Option<String>,
    pub details: Option<Value>,
}

/// Append one history row. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn insert_history(pool: &PgPool, new: &NewHistoryEntry) -> Result<TaskHistoryEntry> {
    let entry = sqlx::query_as::<_, TaskHistoryEntry>(
        "INSERT INTO task_history (task_id, event, agent, details) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(&new.task_id)
    .bind(new.event)
    .bind(&new.agent)
    .bind(&new.details)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert history event {} for task {}",
            new.event, new.task_id
        )
    })?;

    Ok(entry)
}

/// All history rows for a task, oldest first.
pub async fn list_history_for_task(pool: &PgPool, task_id: &str) -> Result<Vec<TaskHistoryEntry>> {
    let entries = sqlx::query_as::<_, TaskHistoryEntry>(
        "SELECT * FROM task_history \
         WHERE task_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list history for task {task_id}"))?;

    Ok(entries)
}

/// Count history rows for a task with a given event kind.
pub async fn count_events_for_task(
    pool: &PgPool,
    task_id: &str,
    event: TaskEvent,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_history \
         WHERE task_id = $1 AND event = $2",
    )
    .bind(task_id)
    .bind(event)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count {event} events for task {task_id}"))?;

    Ok(row.0)
}
