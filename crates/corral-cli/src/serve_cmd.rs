//! The HTTP facade over the lifecycle engine.
//!
//! Handlers parse and validate the body, resolve the request scope (an
//! explicit field wins over the orchestrator's registered scope), dispatch
//! to the engine/selector/reconciler, and translate engine outcomes to
//! status codes. No handler mutates task state outside the engine.

use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use corral_core::claim::{self, ClaimOutcome, ClaimRequest};
use corral_core::config::EngineConfig;
use corral_core::lifecycle::{LifecycleEngine, LifecycleError, SubmitEvidence};
use corral_core::reconciler;
use corral_db::models::{HookStatus, Priority, queue};
use corral_db::queries::history as history_db;
use corral_db::queries::orchestrators as orchestrator_db;
use corral_db::queries::registry as registry_db;
use corral_db::queries::tasks::{self as task_db, NewTask, TaskFieldUpdate};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Conflict(_) | LifecycleError::Dependency(_) => StatusCode::CONFLICT,
            LifecycleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Accept either a single string or an array of strings, the way
/// orchestrators send role and type filters.
fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    }))
}

/// Required fields arrive as `Option` so their absence maps to 400 rather
/// than a deserialization rejection.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub id: Option<String>,
    pub file_path: Option<String>,
    pub branch: Option<String>,
    pub scope: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<Priority>,
    pub role: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub blocked_by: Option<String>,
    pub project_id: Option<String>,
    pub hooks: Option<Value>,
    pub flow: Option<String>,
    pub flow_overrides: Option<Value>,
    #[serde(default)]
    pub auto_accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub orchestrator_id: Option<String>,
    pub agent_name: Option<String>,
    pub scope: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub role_filter: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub type_filter: Option<Vec<String>>,
    pub queue: Option<String>,
    pub lease_duration_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub commits_count: Option<i32>,
    pub turns_used: Option<i32>,
    pub check_results: Option<Value>,
    pub execution_notes: Option<String>,
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptTaskRequest {
    pub accepted_by: Option<String>,
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RejectTaskRequest {
    pub reason: Option<String>,
    pub rejected_by: Option<String>,
    pub version: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequeueTaskRequest {
    pub requested_by: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockTaskRequest {
    pub blocked_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteHookRequest {
    pub status: String,
    pub evidence: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchTaskRequest {
    pub queue: Option<String>,
    pub priority: Option<Priority>,
    pub role: Option<String>,
    #[serde(rename = "type")]
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
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterOrchestratorRequest {
    pub cluster: Option<String>,
    pub machine_id: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRoleRequest {
    pub name: Option<String>,
    pub claims_from: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFlowRequest {
    pub name: Option<String>,
    pub definition: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub scope: Option<String>,
    pub queue: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub orchestrator_id: Option<String>,
    pub scope: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub registered: bool,
    pub scope: String,
    pub queues: task_db::QueueCounts,
    pub provisional_tasks: Vec<task_db::ProvisionalSummary>,
    pub flows: Vec<corral_db::models::Flow>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/claim", post(claim_task))
        .route("/tasks/{id}", get(get_task).patch(patch_task).delete(delete_task))
        .route("/tasks/{id}/submit", post(submit_task))
        .route("/tasks/{id}/accept", post(accept_task))
        .route("/tasks/{id}/reject", post(reject_task))
        .route("/tasks/{id}/requeue", post(requeue_task))
        .route("/tasks/{id}/block", post(block_task))
        .route("/tasks/{id}/unblock", post(unblock_task))
        .route("/tasks/{id}/history", get(task_history))
        .route("/tasks/{id}/hooks/{hook_name}/complete", post(complete_hook))
        .route("/orchestrators/register", post(register_orchestrator))
        .route("/orchestrators/{id}/heartbeat", post(orchestrator_heartbeat))
        .route("/scheduler/poll", get(scheduler_poll))
        .route("/roles", post(register_role).get(list_roles))
        .route("/flows", post(register_flow).get(list_flows))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, config: EngineConfig, bind: &str, port: u16) -> Result<()> {
    let reconciler_handle = reconciler::spawn(pool.clone(), config.clone());

    let app = build_router(AppState { pool, config });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("corral serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler_handle.abort();
    tracing::info!("corral serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Scope resolution
// ---------------------------------------------------------------------------

/// Resolve the request scope: an explicit field wins; otherwise the scope
/// recorded when the named orchestrator registered. Missing scope is a
/// hard validation failure for all listing, claiming, and poll operations.
async fn resolve_scope(
    pool: &PgPool,
    explicit: Option<&str>,
    orchestrator_id: Option<&str>,
) -> Result<String, AppError> {
    if let Some(scope) = explicit.filter(|s| !s.is_empty()) {
        return Ok(scope.to_owned());
    }

    if let Some(id) = orchestrator_id.filter(|s| !s.is_empty()) {
        if let Some(orchestrator) = orchestrator_db::get_orchestrator(pool, id)
            .await
            .map_err(AppError::internal)?
        {
            return Ok(orchestrator.scope);
        }
    }

    Err(AppError::validation("scope is required"))
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

/// Unwrap a required request field, mapping absence or emptiness to 400.
fn required(field: &str, value: Option<String>) -> Result<String, AppError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(format!("{field} is required")))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = required("id", req.id)?;
    let file_path = required("file_path", req.file_path)?;
    let branch = required("branch", req.branch)?;
    let scope = required("scope", req.scope)?;

    let new = NewTask {
        id,
        queue: req.queue.unwrap_or_else(|| queue::INCOMING.to_owned()),
        priority: req.priority.unwrap_or(Priority::P2),
        role: req.role,
        task_type: req.task_type,
        scope,
        branch,
        file_path,
        project_id: req.project_id,
        blocked_by: req.blocked_by,
        hooks: req.hooks,
        flow: req.flow,
        flow_overrides: req.flow_overrides,
        auto_accept: req.auto_accept,
    };

    let task = LifecycleEngine::create(&state.pool, new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, AppError> {
    let scope = resolve_scope(&state.pool, query.scope.as_deref(), None).await?;
    let limit = state.config.page_size(query.limit);
    let offset = query.offset.unwrap_or(0).max(0);

    let tasks = task_db::list_tasks(&state.pool, &scope, query.queue.as_deref(), limit, offset)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let deleted = task_db::delete_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?;

    if deleted == 0 {
        return Err(AppError::not_found(format!("task {id} not found")));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn patch_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PatchTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    // The terminal transition has mandatory side effects; accept is the
    // only path to `done`.
    if req.queue.as_deref() == Some(queue::DONE) {
        return Err(AppError::validation(
            "queue cannot be set to 'done' directly; use the accept operation",
        ));
    }

    if task_db::get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("task {id} not found")));
    }

    let update = TaskFieldUpdate {
        queue: req.queue,
        priority: req.priority,
        role: req.role,
        task_type: req.task_type,
        branch: req.branch,
        file_path: req.file_path,
        project_id: req.project_id,
        blocked_by: req.blocked_by,
        flow: req.flow,
        flow_overrides: req.flow_overrides,
        auto_accept: req.auto_accept,
        execution_notes: req.execution_notes,
        pr_number: req.pr_number,
    };

    let task = task_db::update_task_fields(&state.pool, &id, req.version, &update)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::conflict(format!("task {id} was modified concurrently")))?;

    Ok(Json(task))
}

async fn claim_task(
    State(state): State<AppState>,
    Json(req): Json<ClaimTaskRequest>,
) -> Result<axum::response::Response, AppError> {
    let orchestrator_id = required("orchestrator_id", req.orchestrator_id)?;
    let agent_name = required("agent_name", req.agent_name)?;

    let scope = resolve_scope(
        &state.pool,
        req.scope.as_deref(),
        Some(orchestrator_id.as_str()),
    )
    .await?;

    let claim_request = ClaimRequest {
        scope,
        orchestrator_id,
        agent_name,
        queue: req.queue,
        role_filter: req.role_filter,
        type_filter: req.type_filter,
        lease_duration_secs: req.lease_duration_seconds,
    };

    match claim::claim_one(&state.pool, &state.config, &claim_request, Utc::now()).await? {
        ClaimOutcome::Claimed(task) => Ok(Json(task).into_response()),
        ClaimOutcome::NoTask => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "No tasks available" })),
        )
            .into_response()),
    }
}

async fn submit_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let commits_count = req
        .commits_count
        .ok_or_else(|| AppError::validation("commits_count is required"))?;
    let turns_used = req
        .turns_used
        .ok_or_else(|| AppError::validation("turns_used is required"))?;

    let evidence = SubmitEvidence {
        commits_count,
        turns_used,
        check_results: req.check_results,
        execution_notes: req.execution_notes,
        expected_version: req.version,
    };

    let task =
        LifecycleEngine::submit(&state.pool, &state.config, &id, evidence, Utc::now()).await?;
    Ok(Json(task))
}

async fn accept_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AcceptTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let accepted_by = required("accepted_by", req.accepted_by)?;

    let task = LifecycleEngine::accept(&state.pool, &id, &accepted_by, req.version).await?;
    Ok(Json(task))
}

async fn reject_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RejectTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let reason = required("reason", req.reason)?;
    let rejected_by = required("rejected_by", req.rejected_by)?;

    let task =
        LifecycleEngine::reject(&state.pool, &id, &rejected_by, &reason, req.version).await?;
    Ok(Json(task))
}

async fn requeue_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RequeueTaskRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let task = LifecycleEngine::requeue(
        &state.pool,
        &id,
        req.requested_by.as_deref(),
        req.detail.as_deref(),
    )
    .await?;
    Ok(Json(task))
}

async fn block_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<BlockTaskRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let task = LifecycleEngine::block(&state.pool, &id, req.blocked_by.as_deref()).await?;
    Ok(Json(task))
}

async fn unblock_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task = LifecycleEngine::unblock(&state.pool, &id).await?;
    Ok(Json(task))
}

async fn task_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if task_db::get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("task {id} not found")));
    }

    let history = history_db::list_history_for_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(history))
}

async fn complete_hook(
    State(state): State<AppState>,
    Path((id, hook_name)): Path<(String, String)>,
    Json(req): Json<CompleteHookRequest>,
) -> Result<impl IntoResponse, AppError> {
    let status: HookStatus = req
        .status
        .parse()
        .map_err(|_| AppError::validation("status must be 'passed' or 'failed'"))?;
    if status == HookStatus::Pending {
        return Err(AppError::validation("status must be 'passed' or 'failed'"));
    }

    let task =
        LifecycleEngine::complete_hook(&state.pool, &id, &hook_name, status, req.evidence).await?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Fleet handlers
// ---------------------------------------------------------------------------

async fn register_orchestrator(
    State(state): State<AppState>,
    Json(req): Json<RegisterOrchestratorRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cluster = required("cluster", req.cluster)?;
    let machine_id = required("machine_id", req.machine_id)?;
    let scope = required("scope", req.scope)?;

    let id = format!("{cluster}-{machine_id}");
    let orchestrator =
        orchestrator_db::upsert_orchestrator(&state.pool, &id, &cluster, &machine_id, &scope)
            .await
            .map_err(AppError::internal)?;

    tracing::info!(orchestrator_id = %id, scope = %scope, "orchestrator registered");
    Ok(Json(orchestrator))
}

async fn orchestrator_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let updated = orchestrator_db::heartbeat(&state.pool, &id)
        .await
        .map_err(AppError::internal)?;

    if updated == 0 {
        return Err(AppError::not_found(format!("orchestrator {id} not found")));
    }

    Ok(Json(json!({ "status": "active" })))
}

async fn scheduler_poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<impl IntoResponse, AppError> {
    let registered = match query.orchestrator_id.as_deref() {
        Some(id) if !id.is_empty() => orchestrator_db::get_orchestrator(&state.pool, id)
            .await
            .map_err(AppError::internal)?
            .is_some(),
        _ => false,
    };

    let scope = resolve_scope(
        &state.pool,
        query.scope.as_deref(),
        query.orchestrator_id.as_deref(),
    )
    .await?;

    let queues = task_db::queue_counts(&state.pool, &scope)
        .await
        .map_err(AppError::internal)?;

    let provisional_tasks = task_db::provisional_summaries(&state.pool, &scope)
        .await
        .map_err(AppError::internal)?;

    let flows = registry_db::list_flows(&state.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(PollResponse {
        registered,
        scope,
        queues,
        provisional_tasks,
        flows,
    }))
}

// ---------------------------------------------------------------------------
// Registry handlers
// ---------------------------------------------------------------------------

async fn register_role(
    State(state): State<AppState>,
    Json(req): Json<RegisterRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = required("name", req.name)?;

    let role = registry_db::upsert_role(
        &state.pool,
        &name,
        req.claims_from.as_deref(),
        req.description.as_deref(),
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(role))
}

async fn list_roles(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let roles = registry_db::list_roles(&state.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(roles))
}

async fn register_flow(
    State(state): State<AppState>,
    Json(req): Json<RegisterFlowRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = required("name", req.name)?;

    let definition = req.definition.unwrap_or_else(|| json!({}));
    let flow = registry_db::upsert_flow(&state.pool, &name, &definition)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(flow))
}

async fn list_flows(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let flows = registry_db::list_flows(&state.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(flows))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use corral_core::config::EngineConfig;
    use corral_test_utils::{create_test_db, drop_test_db};

    use super::{AppState, build_router};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn test_router(pool: PgPool) -> axum::Router {
        build_router(AppState {
            pool,
            config: EngineConfig::default(),
        })
    }

    async fn send(
        pool: PgPool,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let app = test_router(pool);
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(id: &str, scope: &str) -> Value {
        json!({
            "id": id,
            "file_path": format!("tasks/{id}.md"),
            "branch": "main",
            "scope": scope,
        })
    }

    async fn create_task(pool: PgPool, id: &str, scope: &str) {
        let resp = send(pool, "POST", "/tasks", Some(create_body(id, scope))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    fn claim_body(scope: &str, agent: &str) -> Value {
        json!({
            "orchestrator_id": "cluster-m1",
            "agent_name": agent,
            "scope": scope,
        })
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_task_defaults() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(pool.clone(), "POST", "/tasks", Some(create_body("T1", "alpha"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let task = body_json(resp).await;
        assert_eq!(task["id"], "T1");
        assert_eq!(task["queue"], "incoming");
        assert_eq!(task["priority"], "P2");
        assert_eq!(task["version"], 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_without_scope_is_bad_request() {
        let (pool, db_name) = create_test_db().await;

        let body = json!({ "id": "T1", "file_path": "t.md", "branch": "main" });
        let resp = send(pool.clone(), "POST", "/tasks", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Full lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_lifecycle_over_http() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("alpha", "agent-1")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let claimed = body_json(resp).await;
        assert_eq!(claimed["queue"], "claimed");
        assert_eq!(claimed["claimed_by"], "agent-1");
        assert_eq!(claimed["version"], 2);
        assert!(claimed["lease_expires_at"].is_string());

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/submit",
            Some(json!({ "commits_count": 3, "turns_used": 10 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let submitted = body_json(resp).await;
        assert_eq!(submitted["queue"], "provisional");
        assert_eq!(submitted["version"], 3);

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/accept",
            Some(json!({ "accepted_by": "reviewer" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let accepted = body_json(resp).await;
        assert_eq!(accepted["queue"], "done");
        assert_eq!(accepted["version"], 4);
        assert!(accepted["completed_at"].is_string());

        let resp = send(pool.clone(), "GET", "/tasks/T1/history", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let history = body_json(resp).await;
        let events: Vec<&str> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event"].as_str().unwrap())
            .collect();
        assert_eq!(events, vec!["created", "claimed", "submitted", "accepted"]);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Claim edge cases
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_claim_empty_queue_says_no_tasks_available() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("alpha", "agent-1")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body, json!({ "message": "No tasks available" }));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_claim_resolves_scope_from_registration() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(
            pool.clone(),
            "POST",
            "/orchestrators/register",
            Some(json!({ "cluster": "cluster", "machine_id": "m1", "scope": "alpha" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let registered = body_json(resp).await;
        assert_eq!(registered["id"], "cluster-m1");

        create_task(pool.clone(), "T1", "alpha").await;

        // No scope in the body: the registration supplies it.
        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(json!({ "orchestrator_id": "cluster-m1", "agent_name": "agent-1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let claimed = body_json(resp).await;
        assert_eq!(claimed["id"], "T1");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_claim_without_any_scope_is_bad_request() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(json!({ "orchestrator_id": "ghost", "agent_name": "agent-1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_submit_unclaimed_task_conflicts() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/submit",
            Some(json!({ "commits_count": 1, "turns_used": 5 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Generic updates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_patch_rejects_done_queue() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(
            pool.clone(),
            "PATCH",
            "/tasks/T1",
            Some(json!({ "queue": "done" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // The task is untouched.
        let resp = send(pool.clone(), "GET", "/tasks/T1", None).await;
        let task = body_json(resp).await;
        assert_eq!(task["queue"], "incoming");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_patch_updates_fields_and_bumps_version() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(
            pool.clone(),
            "PATCH",
            "/tasks/T1",
            Some(json!({ "priority": "P0", "queue": "backlog" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["priority"], "P0");
        assert_eq!(task["queue"], "backlog");
        assert_eq!(task["version"], 2);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Scope isolation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_listing_requires_scope() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(pool.clone(), "GET", "/tasks", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_scopes_partition_listing_and_claiming() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(pool.clone(), "GET", "/tasks?scope=beta", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let tasks = body_json(resp).await;
        assert_eq!(tasks, json!([]));

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("beta", "agent-1")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(pool.clone(), "GET", "/tasks?scope=alpha", None).await;
        let tasks = body_json(resp).await;
        assert_eq!(tasks.as_array().unwrap().len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Reject cycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_reject_cycle_over_http() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;
        send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("alpha", "agent-1")),
        )
        .await;
        send(
            pool.clone(),
            "POST",
            "/tasks/T1/submit",
            Some(json!({ "commits_count": 2, "turns_used": 8 })),
        )
        .await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/reject",
            Some(json!({ "reason": "tests missing", "rejected_by": "reviewer" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["queue"], "incoming");
        assert_eq!(task["rejection_count"], 1);
        assert!(task["claimed_by"].is_null());
        assert!(task["lease_expires_at"].is_null());

        // Rejecting again conflicts: the task left provisional.
        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/reject",
            Some(json!({ "reason": "again", "rejected_by": "reviewer" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_hook_completion_endpoint() {
        let (pool, db_name) = create_test_db().await;

        let mut body = create_body("T1", "alpha");
        body["hooks"] = json!([{ "name": "tests", "status": "pending" }]);
        let resp = send(pool.clone(), "POST", "/tasks", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/hooks/tests/complete",
            Some(json!({ "status": "passed", "evidence": "all green" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["hooks"][0]["status"], "passed");
        assert_eq!(task["hooks"][0]["evidence"], "all green");

        // Only passed/failed are acceptable.
        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T1/hooks/tests/complete",
            Some(json!({ "status": "pending" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_task() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;

        let resp = send(pool.clone(), "DELETE", "/tasks/T1", None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(pool.clone(), "GET", "/tasks/T1", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(pool.clone(), "DELETE", "/tasks/T1", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Fleet endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_heartbeat_unknown_orchestrator() {
        let (pool, db_name) = create_test_db().await;

        let resp = send(pool.clone(), "POST", "/orchestrators/ghost/heartbeat", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_scheduler_poll_snapshot() {
        let (pool, db_name) = create_test_db().await;

        send(
            pool.clone(),
            "POST",
            "/orchestrators/register",
            Some(json!({ "cluster": "cluster", "machine_id": "m1", "scope": "alpha" })),
        )
        .await;
        send(
            pool.clone(),
            "POST",
            "/flows",
            Some(json!({ "name": "standard", "definition": { "stages": ["implement", "review"] } })),
        )
        .await;

        create_task(pool.clone(), "T1", "alpha").await;
        create_task(pool.clone(), "T2", "alpha").await;
        send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("alpha", "agent-1")),
        )
        .await;
        send(
            pool.clone(),
            "POST",
            "/tasks/T1/submit",
            Some(json!({ "commits_count": 1, "turns_used": 4 })),
        )
        .await;

        let resp = send(
            pool.clone(),
            "GET",
            "/scheduler/poll?orchestrator_id=cluster-m1",
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let poll = body_json(resp).await;
        assert_eq!(poll["registered"], true);
        assert_eq!(poll["scope"], "alpha");
        assert_eq!(poll["queues"]["incoming"], 1);
        assert_eq!(poll["queues"]["claimed"], 0);
        assert_eq!(poll["queues"]["provisional"], 1);
        assert_eq!(poll["provisional_tasks"][0]["id"], "T1");
        assert_eq!(poll["flows"][0]["name"], "standard");

        // Unregistered and scopeless: a hard validation failure.
        let resp = send(pool.clone(), "GET", "/scheduler/poll", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    // -----------------------------------------------------------------------
    // Block / unblock / requeue endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_block_unblock_and_requeue_endpoints() {
        let (pool, db_name) = create_test_db().await;

        create_task(pool.clone(), "T1", "alpha").await;
        create_task(pool.clone(), "T2", "alpha").await;

        let resp = send(
            pool.clone(),
            "POST",
            "/tasks/T2/block",
            Some(json!({ "blocked_by": "T1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["queue"], "blocked");

        // Dependency unresolved: unblock conflicts.
        let resp = send(pool.clone(), "POST", "/tasks/T2/unblock", None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Requeue a claimed task.
        send(
            pool.clone(),
            "POST",
            "/tasks/claim",
            Some(claim_body("alpha", "agent-1")),
        )
        .await;
        let resp = send(pool.clone(), "POST", "/tasks/T1/requeue", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["queue"], "incoming");
        assert!(task["claimed_by"].is_null());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
