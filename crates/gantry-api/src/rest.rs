//! REST API handlers

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use gantry_core::{
    CreateSessionRequest, DashboardData, GantryError, ModelInstanceState, OwnerType,
    RequestContext, RunnerState, RunnerTaskResponse, Session, SessionFilter, SessionSummary,
    UpdateSessionRequest,
};
use gantry_scheduler::{Controller, QueueTake};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace};

use crate::error::{ApiError, ApiResult};

/// Header carrying the authenticated owner id
pub const OWNER_HEADER: &str = "x-owner";
/// Header carrying the owner type (`user` or `system`); defaults to `user`
pub const OWNER_TYPE_HEADER: &str = "x-owner-type";

/// Application state shared across handlers
pub struct AppState {
    pub controller: Arc<Controller>,
}

/// Create the API router
pub fn create_router(controller: Arc<Controller>, cors_enabled: bool) -> Router {
    let state = Arc::new(AppState { controller });

    let router = Router::new()
        .route("/api/v1/sessions", post(create_session).get(list_sessions))
        .route(
            "/api/v1/sessions/:id",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/api/v1/runner/:runner_id/nextsession", get(next_session))
        .route("/api/v1/runner/:runner_id/response", post(runner_response))
        .route("/api/v1/runner/:runner_id/state", post(runner_state))
        .route("/api/v1/worker/task/:instance_id", get(worker_task))
        .route("/api/v1/instances", get(list_instances))
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/status", get(get_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Caller identity taken from the headers set by the authentication layer
pub struct Caller(pub RequestContext);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::MissingOwner)?;

        let owner_type = match parts.headers.get(OWNER_TYPE_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| GantryError::Validation("invalid owner type header".to_string()))?
                .parse::<OwnerType>()?,
            None => OwnerType::User,
        };

        Ok(Caller(RequestContext::new(owner, owner_type)))
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.controller.create_session(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let sessions = state.controller.get_sessions(&ctx).await?;
    Ok(Json(sessions.iter().map(SessionSummary::from).collect()))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.controller.get_session(&ctx, &id).await?))
}

async fn update_session(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.controller.update_session(&ctx, &id, req).await?))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.controller.delete_session(&ctx, &id).await?))
}

/// Runner poll. `reject` may repeat, so the query is read as raw pairs.
async fn next_session(
    State(state): State<Arc<AppState>>,
    Path(runner_id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Json<Session>> {
    let filter = SessionFilter::from_params(params)?;
    match state
        .controller
        .shift_session_queue(&filter, &runner_id)
        .await?
    {
        QueueTake::Found(session) => Ok(Json(session)),
        QueueTake::Empty => {
            trace!(runner_id = %runner_id, "Empty poll");
            Err(ApiError::NoSession)
        }
    }
}

async fn runner_response(
    State(state): State<Arc<AppState>>,
    Path(runner_id): Path<String>,
    Json(resp): Json<RunnerTaskResponse>,
) -> ApiResult<Json<Session>> {
    debug!(
        runner_id = %runner_id,
        session_id = %resp.session_id,
        kind = ?resp.response_type,
        "Runner response"
    );
    Ok(Json(state.controller.handle_runner_response(resp).await?))
}

async fn runner_state(
    State(state): State<Arc<AppState>>,
    Path(runner_id): Path<String>,
    Json(mut report): Json<RunnerState>,
) -> ApiResult<StatusCode> {
    if report.id.is_empty() {
        report.id = runner_id;
    } else if report.id != runner_id {
        return Err(GantryError::Validation(format!(
            "runner id {} does not match path {}",
            report.id, runner_id
        ))
        .into());
    }
    state.controller.add_runner_metrics(report).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Local worker pulling its next task
async fn worker_task(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Session>> {
    match state.controller.next_instance_task(&instance_id).await? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NoSession),
    }
}

async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<ModelInstanceState>> {
    Json(state.controller.instance_states().await)
}

async fn dashboard(State(state): State<Arc<AppState>>) -> Json<DashboardData> {
    Json(state.controller.dashboard().await)
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub queued_sessions: usize,
    pub instances: usize,
    pub runners: usize,
    pub local_instances: bool,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let controller = &state.controller;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        queued_sessions: controller.queue_len().await,
        instances: controller.instance_count().await,
        runners: controller.runner_count().await,
        local_instances: controller.pool().is_some(),
    })
}
