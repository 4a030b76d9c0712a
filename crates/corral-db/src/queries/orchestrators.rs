//! Database query functions for the `orchestrators` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::Orchestrator;

/// Register an orchestrator, or refresh an existing registration.
///
/// Re-registering updates the scope, resets the status to `active`, and
/// refreshes `last_heartbeat`.
pub async fn upsert_orchestrator(
    pool: &PgPool,
    id: &str,
    cluster: &str,
    machine_id: &str,
    scope: &str,
) -> Result<Orchestrator> {
    let orchestrator = sqlx::query_as::<_, Orchestrator>(
        "INSERT INTO orchestrators (id, cluster, machine_id, scope) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE \
         SET scope = EXCLUDED.scope, \
             status = 'active', \
             last_heartbeat = NOW() \
         RETURNING *",
    )
    .bind(id)
    .bind(cluster)
    .bind(machine_id)
    .bind(scope)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to register orchestrator {id}"))?;

    Ok(orchestrator)
}

/// Fetch a single orchestrator by ID.
pub async fn get_orchestrator(pool: &PgPool, id: &str) -> Result<Option<Orchestrator>> {
    let orchestrator =
        sqlx::query_as::<_, Orchestrator>("SELECT * FROM orchestrators WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to fetch orchestrator {id}"))?;

    Ok(orchestrator)
}

/// Record a heartbeat: bump `last_heartbeat` and restore `active` status.
/// Returns the number of rows affected (0 when the orchestrator is unknown).
pub async fn heartbeat(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orchestrators \
         SET last_heartbeat = NOW(), status = 'active' \
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record heartbeat for orchestrator {id}"))?;

    Ok(result.rows_affected())
}

/// Mark every active orchestrator silent since `cutoff` as offline.
///
/// Returns the orchestrators that went offline. No cascade to tasks: their
/// leases expire on their own schedule.
pub async fn mark_stale_offline(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Orchestrator>> {
    let stale = sqlx::query_as::<_, Orchestrator>(
        "UPDATE orchestrators \
         SET status = 'offline' \
         WHERE status = 'active' AND last_heartbeat < $1 \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to mark stale orchestrators offline")?;

    Ok(stale)
}

/// List all registered orchestrators, most recently heard from first.
pub async fn list_orchestrators(pool: &PgPool) -> Result<Vec<Orchestrator>> {
    let orchestrators = sqlx::query_as::<_, Orchestrator>(
        "SELECT * FROM orchestrators ORDER BY last_heartbeat DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list orchestrators")?;

    Ok(orchestrators)
}
