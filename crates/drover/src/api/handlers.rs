//! Session lifecycle endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::{info, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::discovery::running::is_external_session_running;
use crate::events::OutputKind;
use crate::runner::Runner;
use crate::session::models::{ApprovalMode, RunnerKind, Session, SessionState};
use crate::session::state::{TransitionOpts, maybe_set_session_name, transition};
use crate::store::{PermissionDecision, ResolvedBy};
use crate::util::{new_id, now_ts};

// ============================================================================
// Request/response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub platform_thread_id: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub approval_choice: i64,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalModeRequest {
    pub approval_choice: i64,
}

#[derive(Debug, Deserialize)]
pub struct PermissionResponseRequest {
    pub request_id: String,
    pub allow: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_input: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct AgentEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default)]
    pub types: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    fn new() -> Self {
        Self { ok: true }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn get_session_or_404(state: &AppState, session_id: &str) -> Result<Session, ApiError> {
    state
        .store
        .get_session(session_id)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

fn runner_for(state: &AppState, session: &Session) -> Result<std::sync::Arc<dyn Runner>, ApiError> {
    state
        .runners
        .get(session.adapter)
        .ok_or_else(|| ApiError::AgentUnavailable(format!("no {} runner configured", session.adapter)))
}

/// Emit an EXTERNAL_SESSION_BUSY warning when the bound external session is
/// open in another CLI. The operation proceeds regardless.
async fn warn_if_external_busy(state: &AppState, session_id: &str) {
    let Some(external_id) = state.store.get_runner_session_id(session_id) else {
        return;
    };
    if is_external_session_running(&external_id) {
        warn!(session_id = %session_id, external_id = %external_id, "external session busy");
        let _ = state
            .store
            .emit_warning(
                session_id,
                "EXTERNAL_SESSION_BUSY",
                "The attached agent session is currently running in another CLI. \
                 Your message will be sent, but may not appear there until it restarts.",
            )
            .await;
    }
}

/// Mark the session failed after a runner error (phase 3 of start/input).
async fn fail_session(state: &AppState, session_id: &str) {
    let _guard = state.store.lock_session(session_id).await;
    let Some(mut session) = state.store.get_session(session_id) else {
        return;
    };
    if transition(
        &mut session,
        SessionState::Error,
        TransitionOpts {
            ended_at: true,
            ..Default::default()
        },
    )
    .is_ok()
    {
        let _ = state.store.update_session(session.clone()).await;
        let _ = state.store.emit_state(&session).await;
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health — unauthenticated liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let adapter = match payload.adapter.as_deref() {
        Some(raw) => raw
            .parse::<RunnerKind>()
            .map_err(ApiError::Validation)?,
        None => state.default_adapter,
    };

    let directory = match payload.directory {
        Some(directory) => {
            let path = std::path::Path::new(&directory);
            if !path.is_dir() {
                return Err(ApiError::validation("directory must be an existing folder"));
            }
            Some(directory.trim_end_matches('/').to_string())
        }
        None => None,
    };

    let mut session = state
        .store
        .create_session(directory, adapter, payload.platform, payload.platform_thread_id)
        .await?;
    if let Some(name) = payload.session_name {
        let cleaned: String = name.split_whitespace().collect::<Vec<_>>().join(" ");
        if !cleaned.is_empty() {
            session.name = cleaned.chars().take(80).collect();
            state.store.update_session(session.clone()).await?;
        }
    }
    info!(session_id = %session.id, adapter = %adapter, "session created");
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.store.list_sessions())
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(get_session_or_404(&state, &session_id)?))
}

/// DELETE /sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let _guard = state.store.lock_session(&session_id).await;
    let session = get_session_or_404(&state, &session_id)?;
    if session.state.is_active() {
        return Err(ApiError::invalid_state("Session is active"));
    }
    state.store.delete_session(&session_id).await?;
    info!(session_id = %session_id, "session deleted");
    Ok(Json(OkResponse::new()))
}

/// POST /sessions/{id}/start
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let mode = ApprovalMode::from_choice(payload.approval_choice);
    let prompt = payload.prompt.unwrap_or_default();

    // Phase 1: validate and transition to RUNNING under the lock.
    let runner = {
        let _guard = state.store.lock_session(&session_id).await;
        let mut session = get_session_or_404(&state, &session_id)?;
        if !matches!(
            session.state,
            SessionState::Created | SessionState::AwaitingInput | SessionState::Error
        ) {
            return Err(ApiError::invalid_state("Session not ready to start"));
        }
        if session.directory.is_none() {
            return Err(ApiError::validation("Session has no directory assigned"));
        }
        let runner = runner_for(&state, &session)?;

        // Clear stale state from previous runs. The external binding is
        // kept: an attached session resumes through it.
        if matches!(session.state, SessionState::AwaitingInput | SessionState::Error) {
            session.ended_at = None;
            session.exit_code = None;
            session.summary = None;
            session.runner_header = None;
            state.store.clear_process(&session_id);
            state.store.clear_pending_inputs(&session_id);
            state.store.clear_last_output(&session_id);
        }
        session.approval_mode = mode;

        warn_if_external_busy(&state, &session_id).await;
        maybe_set_session_name(&mut session, &prompt);
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )?;
        state.store.update_session(session.clone()).await?;
        state.store.emit_state(&session).await?;
        if !prompt.is_empty() {
            state.store.emit_user_input(&session_id, &prompt).await?;
        }
        runner
    };

    // Phase 2: dispatch to the runner with the lock released.
    if let Err(err) = runner.start(&session_id, &prompt, mode).await {
        warn!(session_id = %session_id, error = %err, "runner failed to start");
        // Phase 3: finalize under the lock.
        fail_session(&state, &session_id).await;
        return Err(err.into());
    }

    info!(session_id = %session_id, "session started");
    Ok(Json(get_session_or_404(&state, &session_id)?))
}

/// POST /sessions/{id}/input
pub async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<InputRequest>,
) -> Result<Json<Session>, ApiError> {
    let text = payload.text;

    let runner = {
        let _guard = state.store.lock_session(&session_id).await;
        let mut session = get_session_or_404(&state, &session_id)?;
        if !matches!(
            session.state,
            SessionState::Running | SessionState::AwaitingInput | SessionState::Error
        ) {
            return Err(ApiError::invalid_state("Session not accepting input"));
        }
        let runner = runner_for(&state, &session)?;

        warn_if_external_busy(&state, &session_id).await;

        if matches!(session.state, SessionState::AwaitingInput | SessionState::Error) {
            // A new turn clears the previous terminal markers.
            session.ended_at = None;
            session.exit_code = None;
            transition(&mut session, SessionState::Running, TransitionOpts::default())?;
            state.store.update_session(session.clone()).await?;
            state.store.emit_state(&session).await?;
        } else {
            session.last_activity_at = Some(now_ts());
            state.store.update_session(session.clone()).await?;
        }
        maybe_set_session_name(&mut session, &text);
        state.store.update_session(session.clone()).await?;
        state.store.emit_user_input(&session_id, &text).await?;
        runner
    };

    if let Err(err) = runner.send_input(&session_id, &text).await {
        warn!(session_id = %session_id, error = %err, "runner failed to accept input");
        fail_session(&state, &session_id).await;
        return Err(err.into());
    }

    Ok(Json(get_session_or_404(&state, &session_id)?))
}

/// POST /sessions/{id}/interrupt
pub async fn interrupt_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    // Phase 1: validate and move to INTERRUPTING.
    let runner = {
        let _guard = state.store.lock_session(&session_id).await;
        let mut session = get_session_or_404(&state, &session_id)?;
        match session.state {
            // Idempotent when already idle or interrupting.
            SessionState::AwaitingInput | SessionState::Interrupting => {
                return Ok(Json(session));
            }
            SessionState::Created | SessionState::Error => {
                return Err(ApiError::invalid_state("Session not running"));
            }
            SessionState::Running => {}
        }
        let runner = runner_for(&state, &session)?;
        transition(&mut session, SessionState::Interrupting, TransitionOpts::default())?;
        state.store.update_session(session.clone()).await?;
        state.store.emit_state(&session).await?;
        runner
    };

    // Phase 2: ask the runner to stop, unlocked.
    if let Err(err) = runner.stop(&session_id).await {
        warn!(session_id = %session_id, error = %err, "runner stop failed");
        fail_session(&state, &session_id).await;
        return Err(err.into());
    }

    // Phase 3: complete the interrupt if the sink has not already.
    {
        let _guard = state.store.lock_session(&session_id).await;
        let mut session = get_session_or_404(&state, &session_id)?;
        if session.state == SessionState::Interrupting {
            transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default())?;
            state.store.update_session(session.clone()).await?;
            state.store.emit_state(&session).await?;
        }
    }
    info!(session_id = %session_id, "session interrupted");
    Ok(Json(get_session_or_404(&state, &session_id)?))
}

/// PATCH /sessions/{id}/rename
pub async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<RenameSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let cleaned: String = payload.name.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return Err(ApiError::validation("name must not be empty"));
    }
    let _guard = state.store.lock_session(&session_id).await;
    let mut session = get_session_or_404(&state, &session_id)?;
    session.name = cleaned.chars().take(80).collect();
    state.store.update_session(session.clone()).await?;
    Ok(Json(session))
}

/// PATCH /sessions/{id}/approval-mode
pub async fn update_approval_mode(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<ApprovalModeRequest>,
) -> Result<Json<Session>, ApiError> {
    let mode = ApprovalMode::from_choice(payload.approval_choice);
    let runner = {
        let _guard = state.store.lock_session(&session_id).await;
        let mut session = get_session_or_404(&state, &session_id)?;
        session.approval_mode = mode;
        state.store.update_session(session.clone()).await?;
        runner_for(&state, &session).ok()
    };
    if let Some(runner) = runner {
        runner.update_permission_mode(&session_id, mode).await?;
    }
    Ok(Json(get_session_or_404(&state, &session_id)?))
}

/// POST /sessions/{id}/permission
pub async fn respond_permission(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<PermissionResponseRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    get_session_or_404(&state, &session_id)?;

    let message = if payload.allow {
        payload.message
    } else {
        Some(
            payload
                .message
                .unwrap_or_else(|| "User denied permission".to_string()),
        )
    };
    let decision = PermissionDecision {
        allow: payload.allow,
        message: message.clone(),
        updated_input: payload.updated_input,
        resolved_by: ResolvedBy::User,
    };

    if !state
        .store
        .resolve_pending_permission(&session_id, &payload.request_id, decision)
    {
        return Err(ApiError::not_found(format!(
            "Permission request {} not found or already resolved",
            payload.request_id
        )));
    }
    state
        .store
        .emit_permission_resolved(
            &session_id,
            &payload.request_id,
            ResolvedBy::User,
            payload.allow,
            message,
        )
        .await?;
    info!(session_id = %session_id, request_id = %payload.request_id, allow = payload.allow, "permission resolved");
    Ok(Json(OkResponse::new()))
}

/// POST /sessions/{id}/events — external-agent push.
pub async fn push_agent_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<AgentEventRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let _guard = state.store.lock_session(&session_id).await;
    let mut session = get_session_or_404(&state, &session_id)?;

    // Auto-transition CREATED -> RUNNING on first inbound event.
    if session.state == SessionState::Created {
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )?;
        state.store.update_session(session.clone()).await?;
        state.store.emit_state(&session).await?;
    }

    match payload.event_type.as_str() {
        "output" => {
            let text = payload.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
            let kind = match payload.data.get("kind").and_then(|v| v.as_str()) {
                Some("final") => OutputKind::Final,
                Some("header") => OutputKind::Header,
                _ => OutputKind::Step,
            };
            let is_final = payload.data.get("is_final").and_then(|v| v.as_bool());
            state.store.emit_output(&session_id, text, kind, is_final).await?;
        }
        "status" => {
            let status = payload.data.get("status").and_then(|v| v.as_str()).unwrap_or("");
            let target = match status {
                "running" => Some(SessionState::Running),
                "awaiting_input" | "done" => Some(SessionState::AwaitingInput),
                "error" => Some(SessionState::Error),
                _ => None,
            };
            if let Some(target) = target {
                if target != session.state {
                    transition(
                        &mut session,
                        target,
                        TransitionOpts {
                            ended_at: target == SessionState::Error,
                            allow_same: true,
                            ..Default::default()
                        },
                    )?;
                    state.store.update_session(session.clone()).await?;
                    state.store.emit_state(&session).await?;
                }
            }
        }
        "error" => {
            let code = payload
                .data
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or("AGENT_ERROR");
            let message = payload
                .data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            if session.state != SessionState::Error {
                transition(
                    &mut session,
                    SessionState::Error,
                    TransitionOpts {
                        ended_at: true,
                        ..Default::default()
                    },
                )?;
                state.store.update_session(session.clone()).await?;
                state.store.emit_state(&session).await?;
            }
            state.store.emit_error(&session_id, code, message).await?;
        }
        "permission_request" => {
            let request_id = payload
                .data
                .get("request_id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| new_id("perm"));
            let tool_name = payload
                .data
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or("approval")
                .to_string();
            let tool_input = payload
                .data
                .get("tool_input")
                .cloned()
                .unwrap_or_else(|| payload.data.clone());
            state
                .store
                .add_pending_permission(&session_id, &request_id, &tool_name, tool_input.clone());
            state
                .store
                .emit_permission_request(&session_id, &request_id, &tool_name, tool_input, None)
                .await?;
        }
        other => {
            return Err(ApiError::Validation(format!("unknown event type: {}", other)));
        }
    }

    let mut session = get_session_or_404(&state, &session_id)?;
    session.last_activity_at = Some(now_ts());
    state.store.update_session(session).await?;
    Ok(Json(OkResponse::new()))
}

/// GET /sessions/{id}/events/poll
pub async fn poll_agent_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Value>, ApiError> {
    get_session_or_404(&state, &session_id)?;

    let type_filter: HashSet<String> = match &query.types {
        Some(types) => types.split(',').map(|t| t.trim().to_string()).collect(),
        None => ["user_input", "permission_resolved"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };

    let events = state.store.read_event_log(&session_id, query.since_seq, None);
    let mut filtered = Vec::new();
    for event in events {
        if !type_filter.contains(event.data.type_name()) {
            continue;
        }
        let value = serde_json::to_value(&event).map_err(|err| ApiError::internal(err.to_string()))?;
        filtered.push(json!({
            "type": value.get("type"),
            "data": value.get("data"),
            "seq": event.seq,
        }));
    }
    Ok(Json(json!({"events": filtered})))
}

/// GET /sessions/{id}/usage
pub async fn session_usage(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<crate::store::Usage>, ApiError> {
    get_session_or_404(&state, &session_id)?;
    Ok(Json(state.store.session_usage(&session_id)))
}
