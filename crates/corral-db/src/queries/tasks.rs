//! Database query functions for the `tasks` table.
//!
//! Every lifecycle transition is a single conditional UPDATE predicated on
//! both the current `queue` and the current `version`, incrementing
//! `version` by exactly one. A transition query returning `None` means the
//! predicate matched zero rows: the caller lost an optimistic-concurrency
//! race (or the task is gone) and no state was changed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{Priority, Task, queue};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub queue: String,
    pub priority: Priority,
    pub role: Option<String>,
    pub task_type: Option<String>,
    pub scope: String,
    pub branch: String,
    pub file_path: String,
    pub project_id: Option<String>,
    pub blocked_by: Option<String>,
    pub hooks: Option<Value>,
    pub flow: Option<String>,
    pub flow_overrides: Option<Value>,
    pub auto_accept: bool,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (version, timestamps).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, queue, priority, role, task_type, scope, branch, file_path, \
                            project_id, blocked_by, hooks, flow, flow_overrides, auto_accept) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.queue)
    .bind(new.priority)
    .bind(&new.role)
    .bind(&new.task_type)
    .bind(&new.scope)
    .bind(&new.branch)
    .bind(&new.file_path)
    .bind(&new.project_id)
    .bind(&new.blocked_by)
    .bind(&new.hooks)
    .bind(&new.flow)
    .bind(&new.flow_overrides)
    .bind(new.auto_accept)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task {}", new.id))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch task {id}"))?;

    Ok(task)
}

/// List tasks within a scope, optionally narrowed to one queue, newest last.
pub async fn list_tasks(
    pool: &PgPool,
    scope: &str,
    queue_filter: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE scope = $1 AND ($2::text IS NULL OR queue = $2) \
         ORDER BY created_at ASC \
         LIMIT $3 OFFSET $4",
    )
    .bind(scope)
    .bind(queue_filter)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list tasks in scope {scope}"))?;

    Ok(tasks)
}

/// Delete a task. History rows go with it via ON DELETE CASCADE.
/// Returns the number of rows deleted (0 when the task did not exist).
pub async fn delete_task(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete task {id}"))?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Claim selection
// ---------------------------------------------------------------------------

/// Filter for picking a claim candidate.
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    pub scope: String,
    pub queue: String,
    pub roles: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
}

/// Pick the single most eligible task for a claim filter.
///
/// All predicates are ANDed; ordering is `priority ASC` (P0 first) then
/// `created_at ASC` (oldest first). Tasks with an unresolved `blocked_by`
/// never match. Returns `None` when nothing in the scope is eligible.
pub async fn claim_candidate(pool: &PgPool, filter: &ClaimFilter) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE queue = $1 \
           AND scope = $2 \
           AND (blocked_by IS NULL OR blocked_by = '') \
           AND ($3::text[] IS NULL OR role = ANY($3)) \
           AND ($4::text[] IS NULL OR task_type = ANY($4)) \
         ORDER BY priority ASC, created_at ASC \
         LIMIT 1",
    )
    .bind(&filter.queue)
    .bind(&filter.scope)
    .bind(&filter.roles)
    .bind(&filter.types)
    .fetch_optional(pool)
    .await
    .with_context(|| {
        format!(
            "failed to select claim candidate in scope {} queue {}",
            filter.scope, filter.queue
        )
    })?;

    Ok(task)
}

// ---------------------------------------------------------------------------
// Lifecycle transitions (conditional single-statement writes)
// ---------------------------------------------------------------------------

/// Claim a task: set the lease fields and move it to `to_queue`.
///
/// `to_queue` is `claimed` for the normal path and `provisional` for the
/// review path (claiming from `provisional` leaves it there).
#[allow(clippy::too_many_arguments)]
pub async fn claim_task(
    pool: &PgPool,
    id: &str,
    from_queue: &str,
    to_queue: &str,
    expected_version: i64,
    claimed_by: &str,
    orchestrator_id: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = $4, \
             claimed_by = $5, \
             orchestrator_id = $6, \
             claimed_at = NOW(), \
             lease_expires_at = $7, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = $2 AND version = $3 \
         RETURNING *",
    )
    .bind(id)
    .bind(from_queue)
    .bind(expected_version)
    .bind(to_queue)
    .bind(claimed_by)
    .bind(orchestrator_id)
    .bind(lease_expires_at)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to claim task {id}"))?;

    Ok(task)
}

/// Record a submission and move the task out of `claimed`.
///
/// `to_queue` is `provisional` normally, or `needs_continuation` when the
/// engine's burnout heuristic fires.
pub async fn submit_task(
    pool: &PgPool,
    id: &str,
    expected_version: i64,
    to_queue: &str,
    commits_count: i32,
    turns_used: i32,
    check_results: Option<&Value>,
    execution_notes: Option<&str>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = $3, \
             commits_count = $4, \
             turns_used = $5, \
             check_results = $6, \
             execution_notes = $7, \
             submitted_at = NOW(), \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'claimed' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(to_queue)
    .bind(commits_count)
    .bind(turns_used)
    .bind(check_results)
    .bind(execution_notes)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to submit task {id}"))?;

    Ok(task)
}

/// Accept a provisional task into the terminal `done` queue.
///
/// Sets `completed_at` and drops the (review) lease expiry; `claimed_by`
/// stays for attribution. Dependent unblocking is a separate statement run
/// by the engine after this commits.
pub async fn accept_task(pool: &PgPool, id: &str, expected_version: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'done', \
             completed_at = NOW(), \
             lease_expires_at = NULL, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'provisional' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to accept task {id}"))?;

    Ok(task)
}

/// Reject a provisional task back to `incoming`.
///
/// Bumps `rejection_count` and clears the lease fields in the same
/// statement as the queue change.
pub async fn reject_task(pool: &PgPool, id: &str, expected_version: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'incoming', \
             rejection_count = rejection_count + 1, \
             claimed_by = NULL, \
             claimed_at = NULL, \
             orchestrator_id = NULL, \
             lease_expires_at = NULL, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'provisional' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to reject task {id}"))?;

    Ok(task)
}

/// Hand a claimed task back to `incoming`, releasing its lease.
pub async fn requeue_task(pool: &PgPool, id: &str, expected_version: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'incoming', \
             claimed_by = NULL, \
             claimed_at = NULL, \
             orchestrator_id = NULL, \
             lease_expires_at = NULL, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'claimed' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to requeue task {id}"))?;

    Ok(task)
}

/// Park an incoming task in the `blocked` queue, optionally recording the
/// blocking task id.
pub async fn block_task(
    pool: &PgPool,
    id: &str,
    expected_version: i64,
    blocked_by: Option<&str>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'blocked', \
             blocked_by = COALESCE($3, blocked_by), \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'incoming' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(blocked_by)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to block task {id}"))?;

    Ok(task)
}

/// Return a blocked task to `incoming`, clearing its dependency.
pub async fn unblock_task(pool: &PgPool, id: &str, expected_version: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'incoming', \
             blocked_by = NULL, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND queue = 'blocked' AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to unblock task {id}"))?;

    Ok(task)
}

/// Clear `blocked_by` on every field-gated task waiting on `id`.
///
/// Run after an accept commits. Tasks parked in the `blocked` queue are
/// left alone -- they must keep referencing their blocker until the
/// explicit unblock transition moves them, so `queue = 'blocked'` always
/// implies a non-null `blocked_by`. Returns the dependents that were
/// released.
pub async fn clear_blocked_dependents(pool: &PgPool, id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET blocked_by = NULL, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE blocked_by = $1 AND queue <> 'blocked' \
         RETURNING *",
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to clear dependents of task {id}"))?;

    Ok(tasks)
}

/// Replace a task's hooks array, guarded by the version counter.
pub async fn update_hooks(
    pool: &PgPool,
    id: &str,
    expected_version: i64,
    hooks: &Value,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET hooks = $3, \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND version = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(hooks)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to update hooks on task {id}"))?;

    Ok(task)
}

// ---------------------------------------------------------------------------
// Generic field update (PATCH)
// ---------------------------------------------------------------------------

/// Fields settable through the generic update path.
///
/// `None` means "leave unchanged" -- this path can set fields but not null
/// them; clearing lease or dependency fields is the engine's job. The
/// facade must reject `queue = done` before calling this: the terminal
/// transition has mandatory side effects and only `accept` runs them.
#[derive(Debug, Clone, Default)]
pub struct TaskFieldUpdate {
    pub queue: Option<String>,
    pub priority: Option<Priority>,
    pub role: Option<String>,
    pub task_type: Option<String>,
    pub branch: Option<String>,
    pub file_path: Option<String>,
    pub project_id: Option<String>,
    pub blocked_by: Option<String>,
    pub flow: Option<String>,
    pub flow_overrides: Option<Value>,
    pub auto_accept: Option<bool>,
    pub execution_notes: Option<String>,
    pub pr_number: Option<i32>,
}

/// Apply a generic field update, bumping `version`.
///
/// When `expected_version` is provided the write is conditional on it.
pub async fn update_task_fields(
    pool: &PgPool,
    id: &str,
    expected_version: Option<i64>,
    update: &TaskFieldUpdate,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = COALESCE($3, queue), \
             priority = COALESCE($4, priority), \
             role = COALESCE($5, role), \
             task_type = COALESCE($6, task_type), \
             branch = COALESCE($7, branch), \
             file_path = COALESCE($8, file_path), \
             project_id = COALESCE($9, project_id), \
             blocked_by = COALESCE($10, blocked_by), \
             flow = COALESCE($11, flow), \
             flow_overrides = COALESCE($12, flow_overrides), \
             auto_accept = COALESCE($13, auto_accept), \
             execution_notes = COALESCE($14, execution_notes), \
             pr_number = COALESCE($15, pr_number), \
             version = version + 1, \
             updated_at = NOW() \
         WHERE id = $1 AND ($2::bigint IS NULL OR version = $2) \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(&update.queue)
    .bind(update.priority)
    .bind(&update.role)
    .bind(&update.task_type)
    .bind(&update.branch)
    .bind(&update.file_path)
    .bind(&update.project_id)
    .bind(&update.blocked_by)
    .bind(&update.flow)
    .bind(&update.flow_overrides)
    .bind(update.auto_accept)
    .bind(&update.execution_notes)
    .bind(update.pr_number)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to update fields on task {id}"))?;

    Ok(task)
}

// ---------------------------------------------------------------------------
// Reconciler sweep
// ---------------------------------------------------------------------------

/// Return every expired claim to the pending pool in one bulk statement.
///
/// Deliberately does not bump `version`: a stale submit from the previous
/// holder still collides on `queue = 'claimed'` and fails cleanly, and the
/// released row looks exactly like a system-issued reject.
pub async fn release_expired_leases(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET queue = 'incoming', \
             claimed_by = NULL, \
             claimed_at = NULL, \
             orchestrator_id = NULL, \
             lease_expires_at = NULL, \
             updated_at = NOW() \
         WHERE queue = 'claimed' AND lease_expires_at < $1 \
         RETURNING *",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to release expired leases")?;

    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Scheduler poll projections
// ---------------------------------------------------------------------------

/// Queue counts for the scheduler poll snapshot.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub incoming: i64,
    pub claimed: i64,
    pub provisional: i64,
}

/// Count tasks in the three queues the poll endpoint reports.
pub async fn queue_counts(pool: &PgPool, scope: &str) -> Result<QueueCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT queue, COUNT(*) as cnt \
         FROM tasks \
         WHERE scope = $1 AND queue IN ('incoming', 'claimed', 'provisional') \
         GROUP BY queue",
    )
    .bind(scope)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to count queues in scope {scope}"))?;

    let mut counts = QueueCounts::default();
    for (q, count) in &rows {
        match q.as_str() {
            queue::INCOMING => counts.incoming = *count,
            queue::CLAIMED => counts.claimed = *count,
            queue::PROVISIONAL => counts.provisional = *count,
            _ => {}
        }
    }
    Ok(counts)
}

/// Lightweight projection of a provisional task for the poll snapshot.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ProvisionalSummary {
    pub id: String,
    pub hooks: Option<Value>,
    pub pr_number: Option<i32>,
    pub claimed_by: Option<String>,
}

/// List provisional tasks in a scope, oldest first.
pub async fn provisional_summaries(pool: &PgPool, scope: &str) -> Result<Vec<ProvisionalSummary>> {
    let rows = sqlx::query_as::<_, ProvisionalSummary>(
        "SELECT id, hooks, pr_number, claimed_by \
         FROM tasks \
         WHERE scope = $1 AND queue = 'provisional' \
         ORDER BY created_at ASC",
    )
    .bind(scope)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list provisional tasks in scope {scope}"))?;

    Ok(rows)
}
