use std::sync::Arc;
use std::time::Duration;

use agent_companion_error::{CompanionError, ErrorType, ProblemDetails};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::config::CompanionConfig;
use crate::launcher::{CliLauncher, LaunchError, LaunchRequest};
use crate::rate_limits::{from_codex, RateLimitSnapshot, RateLimitWindow, UsageLimits, UsageWindow};
use crate::registry::{BackendType, SessionInfo, SessionRegistry, SessionStatus};
use crate::terminal::{serve_terminal_socket, TerminalError, TerminalManager, TerminalOptions};
use crate::usage::UsageLimitsService;
use crate::ws_bridge::WsBridge;

#[derive(Debug)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bridge: WsBridge,
    pub launcher: CliLauncher,
    pub terminals: Arc<TerminalManager>,
    pub usage: UsageLimitsService,
}

impl AppState {
    pub fn new(config: CompanionConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let bridge = WsBridge::new(registry.clone());
        let launcher = CliLauncher::new(config.launcher, registry.clone(), bridge.clone());
        Self {
            usage: UsageLimitsService::new(config.usage, registry.clone()),
            terminals: Arc::new(TerminalManager::new(config.terminal)),
            registry,
            bridge,
            launcher,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/usage-limits", get(get_usage_limits))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/message", post(post_message))
        .route("/sessions/:session_id/model", post(set_model))
        .route("/sessions/:session_id/interrupt", post(interrupt_session))
        .route(
            "/sessions/:session_id/permissions/:request_id/reply",
            post(reply_permission),
        )
        .route("/sessions/:session_id/rate-limits", get(get_rate_limits))
        .route(
            "/sessions/:session_id/usage-limits",
            get(get_session_usage_limits),
        )
        .route("/sessions/:session_id/ws", get(session_ws))
        .route("/terminal", get(get_terminal))
        .route("/terminal/spawn", post(spawn_terminal))
        .route("/terminal/kill", post(kill_terminal))
        .route("/terminal/:terminal_id/ws", get(terminal_ws))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("AGENT_COMPANION_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stops every backend and terminal. Called on shutdown.
pub async fn shutdown(state: &Arc<AppState>) {
    for session in state.launcher.list().await {
        if session.status != SessionStatus::Exited {
            if let Err(err) = state.launcher.terminate(&session.id).await {
                tracing::warn!(session_id = %session.id, error = %err, "failed to stop session");
            }
        }
    }
    while let Some(terminal) = state.terminals.get_info(None).await {
        state.terminals.kill(&terminal.id).await;
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_usage_limits,
        list_sessions,
        create_session,
        get_session,
        delete_session,
        post_message,
        set_model,
        interrupt_session,
        reply_permission,
        get_rate_limits,
        get_session_usage_limits,
        get_terminal,
        spawn_terminal,
        kill_terminal
    ),
    components(
        schemas(
            HealthResponse,
            BackendType,
            SessionStatus,
            SessionInfo,
            SessionListResponse,
            CreateSessionRequest,
            MessageRequest,
            MessageResponse,
            SetModelRequest,
            PermissionReplyRequest,
            RateLimitWindow,
            RateLimitSnapshot,
            RateLimitsResponse,
            UsageWindow,
            UsageLimits,
            TerminalStatusResponse,
            SpawnTerminalRequest,
            SpawnTerminalResponse,
            KillTerminalRequest,
            OkResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Agent sessions"),
        (name = "usage", description = "Rate limits and usage"),
        (name = "terminal", description = "Interactive terminals")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:3457")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Companion(#[from] CompanionError),
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        ApiError::Companion(err.into())
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        ApiError::Companion(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Companion(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub backend: Option<BackendType>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MessageRequest {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub ok: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SetModelRequest {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionReplyRequest {
    pub allow: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsResponse {
    pub rate_limits: Option<RateLimitSnapshot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    #[serde(default)]
    pub terminal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatusResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpawnTerminalRequest {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpawnTerminalResponse {
    pub terminal_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KillTerminalRequest {
    #[serde(default)]
    pub terminal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OkResponse {
    pub ok: bool,
}

fn required(value: Option<String>, field: &str) -> Result<String, CompanionError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| CompanionError::missing_field(field))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/usage-limits",
    responses((status = 200, description = "Account usage in canonical form", body = UsageLimits)),
    tag = "usage"
)]
/// Global Usage Limits
///
/// Anthropic account usage when a token is configured, otherwise the most
/// recent Codex report from any session. Unknown windows are `null`.
async fn get_usage_limits(State(state): State<Arc<AppState>>) -> Json<UsageLimits> {
    Json(state.usage.get_usage_limits().await)
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, description = "All sessions", body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.launcher.list().await,
    })
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session launched", body = SessionInfo),
        (status = 400, description = "Invalid request", body = ProblemDetails),
        (status = 409, description = "Session id already active", body = ProblemDetails),
        (status = 500, description = "Backend failed to start", body = ProblemDetails)
    ),
    tag = "sessions"
)]
/// Create Session
///
/// Spawns the backend CLI in `cwd` and starts tracking it.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let backend = request
        .backend
        .ok_or_else(|| CompanionError::missing_field("backend"))?;
    let cwd = required(request.cwd, "cwd")?;
    let info = state
        .launcher
        .launch(LaunchRequest {
            session_id: request.session_id,
            backend,
            cwd,
            model: request.model,
        })
        .await?;
    Ok(Json(info))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, description = "Session", body = SessionInfo),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let info = state
        .launcher
        .get_session(&session_id)
        .await
        .ok_or(CompanionError::SessionNotFound { session_id })?;
    Ok(Json(info))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 204, description = "Session stopped and removed"),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.launcher.terminate(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/message",
    request_body = MessageRequest,
    responses(
        (status = 200, description = "Message written to the backend", body = MessageResponse),
        (status = 400, description = "Blank content or session not running", body = ProblemDetails),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
/// Send Message
///
/// Injects a user turn without needing an open socket.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let content = request.content.unwrap_or_default();
    state
        .bridge
        .inject_user_message(&session_id, &content)
        .await?;
    Ok(Json(MessageResponse {
        ok: true,
        session_id,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/model",
    request_body = SetModelRequest,
    responses(
        (status = 200, description = "Model changed", body = SessionInfo),
        (status = 400, description = "Blank model or session not running", body = ProblemDetails),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn set_model(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SetModelRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let model = request.model.unwrap_or_default();
    state.bridge.set_model(&session_id, &model).await?;
    let info = state
        .launcher
        .get_session(&session_id)
        .await
        .ok_or(CompanionError::SessionNotFound { session_id })?;
    Ok(Json(info))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/interrupt",
    responses(
        (status = 200, description = "Interrupt sent", body = MessageResponse),
        (status = 400, description = "Session not running", body = ProblemDetails),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.bridge.interrupt(&session_id).await?;
    Ok(Json(MessageResponse {
        ok: true,
        session_id,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/permissions/{request_id}/reply",
    request_body = PermissionReplyRequest,
    responses(
        (status = 200, description = "Reply sent", body = MessageResponse),
        (status = 400, description = "Session not running", body = ProblemDetails),
        (status = 404, description = "Unknown session or no pending permission request with this id", body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("request_id" = String, Path, description = "Permission request id")
    ),
    tag = "sessions"
)]
async fn reply_permission(
    State(state): State<Arc<AppState>>,
    Path((session_id, request_id)): Path<(String, String)>,
    Json(request): Json<PermissionReplyRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .bridge
        .respond_permission(
            &session_id,
            &request_id,
            request.allow,
            request.message.as_deref(),
        )
        .await?;
    Ok(Json(MessageResponse {
        ok: true,
        session_id,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/rate-limits",
    responses(
        (status = 200, description = "Raw Codex rate limits, null when none reported", body = RateLimitsResponse),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "usage"
)]
async fn get_rate_limits(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<RateLimitsResponse>, ApiError> {
    if state.registry.entry(&session_id).await.is_none() {
        return Err(CompanionError::SessionNotFound { session_id }.into());
    }
    Ok(Json(RateLimitsResponse {
        rate_limits: state.bridge.get_codex_rate_limits(&session_id).await,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/usage-limits",
    responses(
        (status = 200, description = "Usage limits for the session's backend", body = UsageLimits),
        (status = 404, description = "Unknown session", body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "usage"
)]
/// Session Usage Limits
///
/// Codex sessions answer from their own last report; other backends use the
/// global provider.
async fn get_session_usage_limits(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<UsageLimits>, ApiError> {
    let info = state
        .registry
        .get(&session_id)
        .await
        .ok_or_else(|| CompanionError::SessionNotFound {
            session_id: session_id.clone(),
        })?;
    let limits = match info.backend {
        BackendType::Codex => state
            .bridge
            .get_codex_rate_limits(&session_id)
            .await
            .map(|snapshot| from_codex(&snapshot))
            .unwrap_or_default(),
        BackendType::Claude => state.usage.get_usage_limits().await,
    };
    Ok(Json(limits))
}

async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.registry.entry(&session_id).await.is_none() {
        return Err(CompanionError::SessionNotFound { session_id }.into());
    }
    let bridge = state.bridge.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        if let Err(err) = bridge.attach(&session_id, sink, stream).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to attach socket");
        }
    }))
}

#[utoipa::path(
    get,
    path = "/v1/terminal",
    responses((status = 200, description = "Active terminal, if any", body = TerminalStatusResponse)),
    params(("terminalId" = Option<String>, Query, description = "Terminal id; defaults to the newest live terminal")),
    tag = "terminal"
)]
async fn get_terminal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
) -> Json<TerminalStatusResponse> {
    let response = match state.terminals.get_info(query.terminal_id.as_deref()).await {
        Some(info) => TerminalStatusResponse {
            active: true,
            terminal_id: Some(info.id),
            cwd: Some(info.cwd),
        },
        None => TerminalStatusResponse {
            active: false,
            terminal_id: None,
            cwd: None,
        },
    };
    Json(response)
}

#[utoipa::path(
    post,
    path = "/v1/terminal/spawn",
    request_body = SpawnTerminalRequest,
    responses(
        (status = 200, description = "Terminal started", body = SpawnTerminalResponse),
        (status = 400, description = "Missing cwd", body = ProblemDetails),
        (status = 500, description = "Shell failed to start", body = ProblemDetails)
    ),
    tag = "terminal"
)]
async fn spawn_terminal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpawnTerminalRequest>,
) -> Result<Json<SpawnTerminalResponse>, ApiError> {
    let cwd = required(request.cwd, "cwd")?;
    let terminal_id = state
        .terminals
        .spawn(
            &cwd,
            request.cols,
            request.rows,
            TerminalOptions {
                container_id: request.container_id,
            },
        )
        .await?;
    Ok(Json(SpawnTerminalResponse { terminal_id }))
}

#[utoipa::path(
    post,
    path = "/v1/terminal/kill",
    request_body = KillTerminalRequest,
    responses(
        (status = 200, description = "Terminal killed (or already gone)", body = OkResponse),
        (status = 400, description = "Missing terminalId", body = ProblemDetails)
    ),
    tag = "terminal"
)]
async fn kill_terminal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KillTerminalRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let terminal_id = required(request.terminal_id, "terminalId")?;
    state.terminals.kill(&terminal_id).await;
    Ok(Json(OkResponse { ok: true }))
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(terminal_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.terminals.get_info(Some(&terminal_id)).await.is_none() {
        return Err(CompanionError::TerminalNotFound { terminal_id }.into());
    }
    let terminals = state.terminals.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        serve_terminal_socket(terminals, terminal_id, sink, stream).await;
    }))
}
