//! The claim selector.
//!
//! Given a scope and optional role/type filters, picks at most one
//! eligible task under a deterministic order (`priority ASC, created_at
//! ASC`) and hands it to the engine's claim transition with the observed
//! version. Because the engine's predicate includes that version, at most
//! one concurrent selector across the fleet wins; losers re-select a
//! bounded number of times before reporting `NoTask`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use corral_db::models::{Task, queue};
use corral_db::queries::registry;
use corral_db::queries::tasks::{self as db, ClaimFilter};

use crate::config::EngineConfig;
use crate::lifecycle::{LeaseGrant, LifecycleEngine, LifecycleError};

/// How many times a selector re-selects after losing a claim race before
/// giving up for this request. Clients poll, so giving up early is cheap.
const CLAIM_RETRY_LIMIT: usize = 3;

/// A claim request as the facade hands it to the selector.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub scope: String,
    pub orchestrator_id: String,
    pub agent_name: String,
    /// Explicit queue override. Claiming from `provisional` is the review
    /// path.
    pub queue: Option<String>,
    pub role_filter: Option<Vec<String>>,
    pub type_filter: Option<Vec<String>>,
    pub lease_duration_secs: Option<u64>,
}

/// Outcome of a claim attempt. An empty queue is a normal answer, not an
/// error.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Task),
    NoTask,
}

/// Resolve which queue a claim request draws from.
///
/// Explicit request queue wins; otherwise a single-role filter may carry a
/// registered `claims_from` hint; otherwise `incoming`.
pub async fn resolve_queue(
    pool: &PgPool,
    request: &ClaimRequest,
) -> Result<String, LifecycleError> {
    if let Some(q) = request.queue.as_deref().filter(|q| !q.is_empty()) {
        return Ok(q.to_owned());
    }

    if let Some(filter) = &request.role_filter {
        if let [role] = filter.as_slice() {
            if let Some(registered) = registry::get_role(pool, role).await? {
                if let Some(hint) = registered.claims_from.filter(|h| !h.is_empty()) {
                    return Ok(hint);
                }
            }
        }
    }

    Ok(queue::INCOMING.to_owned())
}

/// Claim at most one task for the request.
///
/// Each attempt runs the ordered candidate query and a conditional claim;
/// between the two, arbitrary concurrent writers may race, and the
/// conditional write decides.
pub async fn claim_one(
    pool: &PgPool,
    config: &EngineConfig,
    request: &ClaimRequest,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, LifecycleError> {
    let resolved_queue = resolve_queue(pool, request).await?;
    let lease_expires_at = now + config.lease_duration(request.lease_duration_secs);

    let filter = ClaimFilter {
        scope: request.scope.clone(),
        queue: resolved_queue,
        roles: request.role_filter.clone(),
        types: request.type_filter.clone(),
    };

    for attempt in 0..CLAIM_RETRY_LIMIT {
        let Some(candidate) = db::claim_candidate(pool, &filter).await? else {
            return Ok(ClaimOutcome::NoTask);
        };

        let lease = LeaseGrant {
            agent_name: request.agent_name.clone(),
            orchestrator_id: request.orchestrator_id.clone(),
            expires_at: lease_expires_at,
        };

        match LifecycleEngine::claim_selected(
            pool,
            &candidate,
            &lease,
            request.role_filter.as_ref(),
            &request.scope,
            now,
        )
        .await?
        {
            Some(task) => return Ok(ClaimOutcome::Claimed(task)),
            None => {
                tracing::debug!(
                    task_id = %candidate.id,
                    attempt = attempt,
                    "lost claim race, re-selecting"
                );
            }
        }
    }

    Ok(ClaimOutcome::NoTask)
}
