//! The transition engine.
//!
//! Every task mutation in the system funnels through here. An operation:
//!
//! 1. fetches the task and checks the action's source queue,
//! 2. evaluates the action's guards ([`Guard`]),
//! 3. issues one conditional UPDATE predicated on `(id, queue, version)`
//!    that increments `version` by exactly one,
//! 4. runs the action's side effects ([`SideEffect`]) -- history append,
//!    dependent unblocking -- only after that write commits.
//!
//! Zero rows matched means a concurrent writer won; the operation reports
//! [`LifecycleError::Conflict`] and nothing else happens. History is
//! best-effort by contract: a missing journal row never invalidates task
//! state.

pub mod transitions;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::PgPool;
use thiserror::Error;

use corral_db::models::{Hook, HookStatus, Task, TaskEvent, queue};
use corral_db::queries::history::{self, NewHistoryEntry};
use corral_db::queries::registry;
use corral_db::queries::tasks as db;

use crate::config::EngineConfig;

pub use transitions::{Action, Guard, SideEffect};

/// Structured outcome of an engine operation. The facade maps these to
/// HTTP status codes without string matching.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Missing or invalid inputs.
    #[error("{0}")]
    Validation(String),
    /// The task (or a referenced entity) does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The task is not in the required queue, the lease expired, the
    /// version did not match, or the conditional update matched zero rows.
    #[error("{0}")]
    Conflict(String),
    /// `blocked_by` is set and not yet resolved.
    #[error("{0}")]
    Dependency(String),
    /// Store failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Evidence attached to a submission.
#[derive(Debug, Clone)]
pub struct SubmitEvidence {
    pub commits_count: i32,
    pub turns_used: i32,
    pub check_results: Option<Value>,
    pub execution_notes: Option<String>,
    /// Optimistic-concurrency check; when absent the version observed by
    /// the engine's own read is used.
    pub expected_version: Option<i64>,
}

/// Lease parameters for a claim picked by the selector.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub agent_name: String,
    pub orchestrator_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The task lifecycle engine. All methods are stateless; the pool is the
/// only shared resource.
pub struct LifecycleEngine;

impl LifecycleEngine {
    // -----------------------------------------------------------------
    // Guard evaluation
    // -----------------------------------------------------------------

    /// Evaluate guards against a task, failing with the most specific
    /// error. The conditional write remains the arbiter under races.
    pub async fn check_guards(
        pool: &PgPool,
        task: &Task,
        guards: &[Guard],
    ) -> Result<(), LifecycleError> {
        for guard in guards {
            match guard {
                Guard::DependencyResolved => {
                    let Some(dep_id) = task.blocked_by.as_deref().filter(|s| !s.is_empty()) else {
                        continue;
                    };
                    let dep = db::get_task(pool, dep_id).await?.ok_or_else(|| {
                        LifecycleError::Dependency(format!(
                            "task {} is blocked by {dep_id}, which does not exist",
                            task.id
                        ))
                    })?;
                    if dep.queue != queue::DONE {
                        return Err(LifecycleError::Dependency(format!(
                            "task {} is blocked by {dep_id} (queue {})",
                            task.id, dep.queue
                        )));
                    }
                }
                Guard::RoleMatches { filter } => {
                    let Some(filter) = filter else { continue };
                    let matches = task
                        .role
                        .as_ref()
                        .is_some_and(|role| filter.contains(role));
                    if !matches {
                        return Err(LifecycleError::Conflict(format!(
                            "task {} role {:?} does not match the requested filter",
                            task.id, task.role
                        )));
                    }
                }
                Guard::LeaseValid { now } => {
                    if !task.has_active_lease(*now) {
                        return Err(LifecycleError::Conflict(format!(
                            "task {} has no active lease (expired or never claimed)",
                            task.id
                        )));
                    }
                }
                Guard::VersionMatches { expected } => {
                    if task.version != *expected {
                        return Err(LifecycleError::Conflict(format!(
                            "task {} is at version {}, expected {expected}",
                            task.id, task.version
                        )));
                    }
                }
                Guard::ScopeMatches { scope } => {
                    if task.scope != *scope {
                        // Cross-scope tasks are invisible, not forbidden.
                        return Err(LifecycleError::NotFound(format!(
                            "task {} not found in scope {scope}",
                            task.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Side effects
    // -----------------------------------------------------------------

    /// Run side effects after the primary write commits. Failures are
    /// logged at `warn` and never surfaced: the transition already
    /// happened.
    async fn run_side_effects(pool: &PgPool, task: &Task, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::AppendHistory {
                    event,
                    agent,
                    details,
                } => {
                    let entry = NewHistoryEntry {
                        task_id: task.id.clone(),
                        event,
                        agent,
                        details,
                    };
                    if let Err(e) = history::insert_history(pool, &entry).await {
                        tracing::warn!(
                            task_id = %task.id,
                            event = %event,
                            error = %e,
                            "failed to append history (best-effort)"
                        );
                    }
                }
                SideEffect::UnblockDependents => {
                    match db::clear_blocked_dependents(pool, &task.id).await {
                        Ok(dependents) => {
                            for dep in &dependents {
                                tracing::info!(
                                    task_id = %dep.id,
                                    unblocked_by = %task.id,
                                    "dependency resolved"
                                );
                                let entry = NewHistoryEntry {
                                    task_id: dep.id.clone(),
                                    event: TaskEvent::Unblocked,
                                    agent: None,
                                    details: Some(json!({ "unblocked_by": task.id })),
                                };
                                if let Err(e) = history::insert_history(pool, &entry).await {
                                    tracing::warn!(
                                        task_id = %dep.id,
                                        error = %e,
                                        "failed to append unblock history (best-effort)"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                task_id = %task.id,
                                error = %e,
                                "failed to clear dependents (best-effort)"
                            );
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------

    /// Create a task. Tasks start in `incoming` (or explicitly `blocked`)
    /// at version 1; `done` can only be reached through [`Self::accept`].
    pub async fn create(pool: &PgPool, new: db::NewTask) -> Result<Task, LifecycleError> {
        if new.queue == queue::DONE {
            return Err(LifecycleError::Validation(
                "tasks cannot be created in queue 'done'; accept is the only path there"
                    .to_owned(),
            ));
        }

        // Role names are advisory until any are registered; then they bind.
        if let Some(role) = new.role.as_deref() {
            let registered = registry::count_roles(pool).await?;
            if registered > 0 && registry::get_role(pool, role).await?.is_none() {
                return Err(LifecycleError::Validation(format!(
                    "unknown role {role:?}"
                )));
            }
        }

        if let Some(dep_id) = new.blocked_by.as_deref().filter(|s| !s.is_empty()) {
            if db::get_task(pool, dep_id).await?.is_none() {
                return Err(LifecycleError::Validation(format!(
                    "blocked_by references missing task {dep_id}"
                )));
            }
        } else if new.queue == queue::BLOCKED {
            return Err(LifecycleError::Validation(
                "tasks created in queue 'blocked' require blocked_by".to_owned(),
            ));
        }

        // Identity collisions surface from the insert itself: a pre-check
        // would race against a concurrent create of the same id.
        let task = match db::insert_task(pool, &new).await {
            Ok(task) => task,
            Err(e) if is_unique_violation(&e) => {
                return Err(LifecycleError::Conflict(format!(
                    "task {} already exists",
                    new.id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Created,
            agent: None,
            details: Some(json!({ "queue": task.queue, "priority": task.priority })),
        }];
        Self::run_side_effects(pool, &task, effects).await;

        Ok(task)
    }

    /// Claim a candidate picked by the selector.
    ///
    /// The candidate row came out of a filtered query, but the guards are
    /// re-evaluated here so the engine never trusts a stale snapshot more
    /// than it has to. Returns `Ok(None)` when the conditional write
    /// matched zero rows -- a concurrent claimer won and the selector
    /// should re-select.
    pub async fn claim_selected(
        pool: &PgPool,
        candidate: &Task,
        lease: &LeaseGrant,
        role_filter: Option<&Vec<String>>,
        request_scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, LifecycleError> {
        // The review path claims out of `provisional` and leaves the task
        // there; every other source queue moves to `claimed`.
        let review = candidate.queue == queue::PROVISIONAL;
        let action = if review {
            Action::ClaimForReview
        } else {
            Action::Claim
        };
        let to_queue = if review { queue::PROVISIONAL } else { queue::CLAIMED };

        let guards = [
            Guard::ScopeMatches {
                scope: request_scope.to_owned(),
            },
            Guard::DependencyResolved,
            Guard::RoleMatches {
                filter: role_filter.cloned(),
            },
        ];
        Self::check_guards(pool, candidate, &guards).await?;

        let claimed = db::claim_task(
            pool,
            &candidate.id,
            &candidate.queue,
            to_queue,
            candidate.version,
            &lease.agent_name,
            &lease.orchestrator_id,
            lease.expires_at,
        )
        .await?;

        let Some(task) = claimed else {
            return Ok(None);
        };

        tracing::info!(
            task_id = %task.id,
            agent = %lease.agent_name,
            orchestrator = %lease.orchestrator_id,
            lease_expires_at = %lease.expires_at,
            review = review,
            "task claimed"
        );

        let effects = vec![SideEffect::AppendHistory {
            event: action.event(),
            agent: Some(lease.agent_name.clone()),
            details: Some(json!({
                "orchestrator_id": lease.orchestrator_id,
                "lease_expires_at": lease.expires_at,
                "claimed_at": now,
            })),
        }];
        Self::run_side_effects(pool, &task, effects).await;

        Ok(Some(task))
    }

    /// Submit results for a claimed task.
    ///
    /// Routes to `provisional`, or to `needs_continuation` when the
    /// burnout heuristic fires: no commits after the turn threshold, or
    /// the hard turn limit reached either way.
    pub async fn submit(
        pool: &PgPool,
        config: &EngineConfig,
        id: &str,
        evidence: SubmitEvidence,
        now: DateTime<Utc>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Submit) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'claimed'",
                task.queue
            )));
        }

        let mut guards = vec![Guard::LeaseValid { now }];
        if let Some(expected) = evidence.expected_version {
            guards.push(Guard::VersionMatches { expected });
        }
        Self::check_guards(pool, &task, &guards).await?;

        let burnout = burnout_detected(config, evidence.commits_count, evidence.turns_used);
        let to_queue = if burnout {
            queue::NEEDS_CONTINUATION
        } else {
            queue::PROVISIONAL
        };

        let updated = db::submit_task(
            pool,
            id,
            task.version,
            to_queue,
            evidence.commits_count,
            evidence.turns_used,
            evidence.check_results.as_ref(),
            evidence.execution_notes.as_deref(),
        )
        .await?
        .ok_or_else(|| {
            LifecycleError::Conflict(format!("task {id} was modified concurrently"))
        })?;

        tracing::info!(
            task_id = %id,
            to_queue = %to_queue,
            commits = evidence.commits_count,
            turns = evidence.turns_used,
            "task submitted"
        );

        let mut effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Submitted,
            agent: task.claimed_by.clone(),
            details: Some(json!({
                "commits_count": evidence.commits_count,
                "turns_used": evidence.turns_used,
            })),
        }];
        if burnout {
            let threshold = if evidence.turns_used >= config.max_turn_limit {
                config.max_turn_limit
            } else {
                config.burnout_turn_threshold
            };
            effects.push(SideEffect::AppendHistory {
                event: TaskEvent::BurnoutDetected,
                agent: task.claimed_by.clone(),
                details: Some(json!({
                    "turns_used": evidence.turns_used,
                    "threshold": threshold,
                })),
            });
        }
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Accept a provisional task into the terminal `done` queue, then
    /// release every field-gated task blocked on it. Tasks parked in the
    /// `blocked` queue stay there until explicitly unblocked.
    pub async fn accept(
        pool: &PgPool,
        id: &str,
        accepted_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Accept) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'provisional'",
                task.queue
            )));
        }

        if let Some(expected) = expected_version {
            Self::check_guards(pool, &task, &[Guard::VersionMatches { expected }]).await?;
        }

        let updated = db::accept_task(pool, id, task.version).await?.ok_or_else(|| {
            LifecycleError::Conflict(format!("task {id} was modified concurrently"))
        })?;

        tracing::info!(task_id = %id, accepted_by = %accepted_by, "task accepted");

        let effects = vec![
            SideEffect::AppendHistory {
                event: TaskEvent::Accepted,
                agent: Some(accepted_by.to_owned()),
                details: None,
            },
            SideEffect::UnblockDependents,
        ];
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Reject a provisional task back to `incoming`, releasing its lease
    /// and bumping the rejection tally.
    pub async fn reject(
        pool: &PgPool,
        id: &str,
        rejected_by: &str,
        reason: &str,
        expected_version: Option<i64>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Reject) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'provisional'",
                task.queue
            )));
        }

        if let Some(expected) = expected_version {
            Self::check_guards(pool, &task, &[Guard::VersionMatches { expected }]).await?;
        }

        let updated = db::reject_task(pool, id, task.version).await?.ok_or_else(|| {
            LifecycleError::Conflict(format!("task {id} was modified concurrently"))
        })?;

        tracing::info!(task_id = %id, rejected_by = %rejected_by, reason = %reason, "task rejected");

        let effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Rejected,
            agent: Some(rejected_by.to_owned()),
            details: Some(json!({ "reason": reason })),
        }];
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Hand a claimed task back to `incoming` without prejudice.
    pub async fn requeue(
        pool: &PgPool,
        id: &str,
        agent: Option<&str>,
        detail: Option<&str>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Requeue) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'claimed'",
                task.queue
            )));
        }

        let updated = db::requeue_task(pool, id, task.version).await?.ok_or_else(|| {
            LifecycleError::Conflict(format!("task {id} was modified concurrently"))
        })?;

        tracing::info!(task_id = %id, "task requeued");

        let effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Requeued,
            agent: agent.map(str::to_owned),
            details: detail.map(|d| json!({ "detail": d })),
        }];
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Park an incoming task in `blocked`, recording what it waits on.
    pub async fn block(
        pool: &PgPool,
        id: &str,
        blocked_by: Option<&str>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Block) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'incoming'",
                task.queue
            )));
        }

        // A blocked task must reference an existing blocker.
        let effective = blocked_by.or(task.blocked_by.as_deref()).filter(|s| !s.is_empty());
        let Some(dep_id) = effective else {
            return Err(LifecycleError::Validation(format!(
                "blocking task {id} requires blocked_by"
            )));
        };
        if db::get_task(pool, dep_id).await?.is_none() {
            return Err(LifecycleError::Validation(format!(
                "blocked_by references missing task {dep_id}"
            )));
        }

        let updated = db::block_task(pool, id, task.version, blocked_by)
            .await?
            .ok_or_else(|| {
                LifecycleError::Conflict(format!("task {id} was modified concurrently"))
            })?;

        tracing::info!(task_id = %id, blocked_by = %dep_id, "task blocked");

        let effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Blocked,
            agent: None,
            details: Some(json!({ "blocked_by": dep_id })),
        }];
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Return a blocked task to `incoming` once its dependency resolved.
    pub async fn unblock(pool: &PgPool, id: &str) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        if !transitions::queue_admits(&task, Action::Unblock) {
            return Err(LifecycleError::Conflict(format!(
                "task {id} is in queue {:?}, expected 'blocked'",
                task.queue
            )));
        }

        Self::check_guards(pool, &task, &[Guard::DependencyResolved]).await?;

        let updated = db::unblock_task(pool, id, task.version).await?.ok_or_else(|| {
            LifecycleError::Conflict(format!("task {id} was modified concurrently"))
        })?;

        tracing::info!(task_id = %id, "task unblocked");

        let effects = vec![SideEffect::AppendHistory {
            event: TaskEvent::Unblocked,
            agent: None,
            details: None,
        }];
        Self::run_side_effects(pool, &updated, effects).await;

        Ok(updated)
    }

    /// Set the status of one named hook on a task.
    ///
    /// Hooks are updated independently of the queue: only the version
    /// counter guards the read-modify-write.
    pub async fn complete_hook(
        pool: &PgPool,
        id: &str,
        hook_name: &str,
        status: HookStatus,
        evidence: Option<String>,
    ) -> Result<Task, LifecycleError> {
        let task = db::get_task(pool, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("task {id} not found")))?;

        let hooks_value = task.hooks.clone().ok_or_else(|| {
            LifecycleError::Validation(format!("task {id} has no hooks"))
        })?;
        let mut hooks: Vec<Hook> = serde_json::from_value(hooks_value).map_err(|e| {
            LifecycleError::Internal(anyhow::anyhow!("task {id} hooks are malformed: {e}"))
        })?;

        let hook = hooks
            .iter_mut()
            .find(|h| h.name == hook_name)
            .ok_or_else(|| {
                LifecycleError::NotFound(format!("hook {hook_name:?} not found on task {id}"))
            })?;
        hook.status = status;
        hook.evidence = evidence;

        let serialized = serde_json::to_value(&hooks)
            .map_err(|e| LifecycleError::Internal(anyhow::anyhow!(e)))?;

        let updated = db::update_hooks(pool, id, task.version, &serialized)
            .await?
            .ok_or_else(|| {
                LifecycleError::Conflict(format!("task {id} was modified concurrently"))
            })?;

        tracing::info!(task_id = %id, hook = %hook_name, status = %status, "hook updated");

        Ok(updated)
    }
}

/// Burnout heuristic: a stuck agent is one that burned through the turn
/// threshold without producing a commit, or hit the hard turn limit.
pub fn burnout_detected(config: &EngineConfig, commits_count: i32, turns_used: i32) -> bool {
    (commits_count == 0 && turns_used >= config.burnout_turn_threshold)
        || turns_used >= config.max_turn_limit
}

/// Whether a store error is a unique-constraint violation (Postgres 23505).
fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burnout_requires_no_commits_at_threshold() {
        let cfg = EngineConfig::default();
        assert!(burnout_detected(&cfg, 0, 80));
        assert!(burnout_detected(&cfg, 0, 85));
        assert!(!burnout_detected(&cfg, 1, 85));
        assert!(!burnout_detected(&cfg, 0, 79));
    }

    #[test]
    fn burnout_at_hard_limit_regardless_of_commits() {
        let cfg = EngineConfig::default();
        assert!(burnout_detected(&cfg, 5, 100));
        assert!(burnout_detected(&cfg, 5, 120));
        assert!(!burnout_detected(&cfg, 5, 99));
    }
}
