use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use shellgate_policy::Policy;
use shellgate_session::{CreateSessionRequest, SessionRegistry};
use shellgate_types::{CommandId, CommandOrigin, CommandRequest, GateError, SessionId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::web::{rate_limit::ConnectionRateLimiter, ws};

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub rate_limiter: Arc<ConnectionRateLimiter>,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session_details).delete(destroy_session),
        )
        .route("/api/sessions/:id/execute", post(execute_command))
        .route(
            "/api/sessions/:id/commands",
            get(list_commands).post(submit_command),
        )
        .route(
            "/api/sessions/:id/commands/:command_id/approve",
            post(approve_command),
        )
        .route(
            "/api/sessions/:id/commands/:command_id/deny",
            post(deny_command),
        )
        .route("/api/sessions/:id/kill", post(kill_command))
        .route("/api/policy", get(get_policy).put(update_policy))
        .route("/api/classify", post(classify_command))
        .route("/ws", get(ws::websocket_handler))
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.registry.backend().backend_name(),
        "sessions": state.registry.live_count(),
    }))
}

/// GET /api/sessions - List all sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.registry.list() }))
}

/// POST /api/sessions - Create a session (idempotent for a known sessionId)
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let session = state.registry.create(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": session.id(),
            "workspace": session.workspace(),
            "createdAt": session.created_at().to_rfc3339(),
            "websocketUrl": format!("/ws?sessionId={}", session.id()),
        })),
    ))
}

/// GET /api/sessions/:id - Session summary with its commands
async fn get_session_details(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;

    Ok(Json(json!({
        "session": session.summary(),
        "commands": session.commands(),
        "pendingApprovals": session.pending_approvals(),
    })))
}

/// DELETE /api/sessions/:id - Destroy a session and its backend
async fn destroy_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.registry.destroy(&id).await?;
    info!(session_id = %id, "session destroyed via API");

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    command: String,
    #[serde(default)]
    working_directory: Option<PathBuf>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// POST /api/sessions/:id/execute - Run a command and wait for its result
async fn execute_command(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;
    let request = CommandRequest {
        command: body.command,
        working_directory: body.working_directory,
        reasoning: body.reasoning,
        ..Default::default()
    };
    let result = session.execute(request).await?;
    let error = (!result.output.stderr.is_empty()).then_some(result.output.stderr);

    Ok(Json(json!({
        "commandId": result.command.id,
        "state": result.command.state(),
        "output": result.output.stdout,
        "error": error,
        "exitCode": result.command.exit_code.or(result.output.exit_code),
    })))
}

/// POST /api/sessions/:id/commands - Queue a command without waiting
async fn submit_command(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(request): Json<CommandRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let session = state.registry.get(&id)?;
    let command = session.submit(request, CommandOrigin::Agent).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "command": command }))))
}

/// GET /api/sessions/:id/commands
async fn list_commands(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;
    Ok(Json(json!({ "commands": session.commands() })))
}

async fn approve_command(
    State(state): State<AppState>,
    Path((id, command_id)): Path<(SessionId, CommandId)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;
    session.confirm(command_id)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
struct DenyBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn deny_command(
    State(state): State<AppState>,
    Path((id, command_id)): Path<(SessionId, CommandId)>,
    body: Option<Json<DenyBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;
    let reason = body.and_then(|Json(body)| body.reason);
    session.deny(command_id, reason)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KillBody {
    #[serde(default)]
    command_id: Option<CommandId>,
}

/// POST /api/sessions/:id/kill - Interrupt the running (or given) command
async fn kill_command(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    body: Option<Json<KillBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.registry.get(&id)?;
    let target = body.and_then(|Json(body)| body.command_id);
    let changed = session.kill_command(target).await?;
    Ok(Json(json!({ "success": true, "commands": changed })))
}

/// GET /api/policy
async fn get_policy(State(state): State<AppState>) -> Json<Policy> {
    Json(state.registry.policy().snapshot().as_ref().clone())
}

/// PUT /api/policy - Replace the policy for subsequent classifications
async fn update_policy(
    State(state): State<AppState>,
    Json(policy): Json<Policy>,
) -> Result<Json<Policy>, AppError> {
    let updated = state.registry.policy().update(policy)?;
    Ok(Json(updated.as_ref().clone()))
}

#[derive(Debug, Deserialize)]
struct ClassifyBody {
    command: String,
}

/// POST /api/classify - Classify without running anything
async fn classify_command(
    State(state): State<AppState>,
    Json(body): Json<ClassifyBody>,
) -> Json<shellgate_types::Classification> {
    Json(state.registry.policy().classify(&body.command))
}

/// Error handling
#[derive(Debug)]
pub enum AppError {
    Gate(GateError),
    Anyhow(anyhow::Error),
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        AppError::Gate(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GateError>() {
            Ok(gate) => AppError::Gate(gate),
            Err(err) => AppError::Anyhow(err),
        }
    }
}

/// HTTP status for each failure kind
pub fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::SessionNotFound(_) | GateError::CommandNotFound(_) => StatusCode::NOT_FOUND,
        GateError::ResourceLimitExceeded { .. } | GateError::ConnectionRateLimited { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        GateError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        GateError::CommandRejected { .. } | GateError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        GateError::SessionTerminated(_) => StatusCode::GONE,
        GateError::BackendCreateFailed(_) | GateError::BackendClosed(_) => StatusCode::BAD_GATEWAY,
        GateError::BackendUnresponsive { .. } => StatusCode::GATEWAY_TIMEOUT,
        GateError::Configuration(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Gate(err) => (status_for(&err), err.to_string()),
            AppError::Anyhow(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)),
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %message, "request failed");
        }

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
