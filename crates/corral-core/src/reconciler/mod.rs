//! The lease reconciler.
//!
//! A scheduled sweeper, independent of request handling, whose only shared
//! resource is the store. Each cycle is two bulk conditional writes:
//! release expired claims back to `incoming`, then mark silent
//! orchestrators offline. Re-running with no new expirations is a no-op,
//! and the sweep is safe concurrent with live client traffic.
//!
//! Released rows keep their `version`: a stale submit from the previous
//! lease holder still collides on `queue = 'claimed'` and fails cleanly.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use corral_db::models::{Orchestrator, Task, TaskEvent};
use corral_db::queries::history::{self, NewHistoryEntry};
use corral_db::queries::orchestrators;
use corral_db::queries::tasks as db;

use crate::config::EngineConfig;

/// What one reconciler cycle did.
#[derive(Debug, Default)]
pub struct ReconcilerReport {
    /// Tasks whose expired claims were returned to `incoming`.
    pub released: Vec<Task>,
    /// Orchestrators marked offline for missing heartbeats.
    pub offlined: Vec<Orchestrator>,
}

impl ReconcilerReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.offlined.is_empty()
    }
}

/// Run one reconciliation cycle at `now`.
///
/// Individual history-append failures are logged and do not abort the
/// sweep; the bulk writes are the authoritative part.
pub async fn run_once(
    pool: &PgPool,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<ReconcilerReport> {
    // 1. Release expired claims.
    let released = db::release_expired_leases(pool, now).await?;
    for task in &released {
        tracing::info!(
            task_id = %task.id,
            scope = %task.scope,
            "lease expired, task returned to incoming"
        );
        let entry = NewHistoryEntry {
            task_id: task.id.clone(),
            event: TaskEvent::Requeued,
            agent: None,
            details: Some(json!({ "detail": "Lease expired" })),
        };
        if let Err(e) = history::insert_history(pool, &entry).await {
            tracing::warn!(
                task_id = %task.id,
                error = %e,
                "failed to append lease-expiry history (best-effort)"
            );
        }
    }

    // 2. Mark silent orchestrators offline. No cascade to tasks.
    let cutoff = now - TimeDelta::seconds(config.stale_orchestrator_secs as i64);
    let offlined = orchestrators::mark_stale_offline(pool, cutoff).await?;
    for orchestrator in &offlined {
        tracing::info!(
            orchestrator_id = %orchestrator.id,
            last_heartbeat = %orchestrator.last_heartbeat,
            "orchestrator marked offline"
        );
    }

    Ok(ReconcilerReport { released, offlined })
}

/// Spawn the reconciler as an independent periodic task.
///
/// Runs until the returned handle is aborted (typically at server
/// shutdown). Sweep failures are logged and the cadence continues.
pub fn spawn(pool: PgPool, config: EngineConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.reconcile_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match run_once(&pool, &config, Utc::now()).await {
                Ok(report) if report.is_empty() => {
                    tracing::debug!("reconciler cycle: nothing to do");
                }
                Ok(report) => {
                    tracing::info!(
                        released = report.released.len(),
                        offlined = report.offlined.len(),
                        "reconciler cycle complete"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "reconciler cycle failed");
                }
            }
        }
    })
}
