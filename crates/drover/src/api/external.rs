//! External session endpoints: discovery, history, attach and sync.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::discovery::{ExternalRunnerType, ExternalSessionDetail, ExternalSessionMessage};
use crate::session::models::{RunnerKind, Session, SessionState};
use crate::util::now_ts;

/// History fetched on attach.
const ATTACH_HISTORY_LIMIT: usize = 100;

/// History fetched on sync.
const SYNC_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ExternalSessionsQuery {
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExternalHistoryQuery {
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub external_id: Option<String>,
    pub runner_type: Option<String>,
    pub directory: Option<String>,
}

fn parse_runner_type(raw: Option<&str>) -> Result<ExternalRunnerType, ApiError> {
    let raw = raw.unwrap_or("claude_code");
    raw.parse::<ExternalRunnerType>().map_err(|_| {
        ApiError::Validation(format!(
            "Invalid runner_type: {}. Must be claude_code, codex_cli or pi_agent.",
            raw
        ))
    })
}

/// GET /external-sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ExternalSessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    let directory = query.directory.as_deref();

    let mut sessions = match query.runner_type.as_deref() {
        Some(raw) => {
            let runner_type = parse_runner_type(Some(raw))?;
            state.scanner.list(runner_type, directory, limit)
        }
        None => {
            // No filter: merge every backend's sessions.
            let mut all = Vec::new();
            for runner_type in [
                ExternalRunnerType::ClaudeCode,
                ExternalRunnerType::CodexCli,
                ExternalRunnerType::PiAgent,
            ] {
                all.extend(state.scanner.list(runner_type, directory, limit));
            }
            all
        }
    };
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    sessions.truncate(limit);

    Ok(Json(json!({"sessions": sessions})))
}

/// GET /external-sessions/{id}/history
pub async fn session_history(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<ExternalHistoryQuery>,
) -> Result<Json<ExternalSessionDetail>, ApiError> {
    let runner_type = parse_runner_type(query.runner_type.as_deref())?;
    let limit = query.limit.unwrap_or(ATTACH_HISTORY_LIMIT);
    let detail = state
        .scanner
        .detail(runner_type, &external_id, limit)
        .ok_or_else(|| ApiError::not_found(format!("External session not found: {}", external_id)))?;
    Ok(Json(detail))
}

/// True when this assistant message ends a turn (next message is from the
/// user, or it is the last message).
fn is_turn_final(messages: &[ExternalSessionMessage], index: usize) -> bool {
    if messages[index].role != "assistant" {
        return false;
    }
    match messages.get(index + 1) {
        Some(next) => next.role == "user",
        None => true,
    }
}

async fn replay_history(
    state: &AppState,
    session_id: &str,
    messages: &[ExternalSessionMessage],
    offset: usize,
) -> Result<(), ApiError> {
    for index in offset..messages.len() {
        let message = &messages[index];
        state
            .store
            .emit_history_message(
                session_id,
                &message.role,
                &message.content,
                message.thinking.as_deref(),
                is_turn_final(messages, index),
            )
            .await?;
    }
    Ok(())
}

/// POST /sessions/attach
pub async fn attach_session(
    State(state): State<AppState>,
    Json(payload): Json<AttachRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let external_id = payload
        .external_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("external_id is required"))?;
    let runner_type = parse_runner_type(Some(
        payload
            .runner_type
            .as_deref()
            .ok_or_else(|| ApiError::validation("runner_type is required"))?,
    ))?;
    let directory = payload
        .directory
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::validation("directory is required"))?;

    if !runner_type.supports_attach() {
        return Err(ApiError::Validation(format!(
            "{} sessions are view-only and cannot be attached",
            runner_type
        )));
    }

    // Idempotent: an already-bound external id returns its session.
    if let Some(existing_id) = state.store.find_session_by_runner_session_id(&external_id) {
        if let Some(existing) = state.store.get_session(&existing_id) {
            info!(external_id = %external_id, session_id = %existing_id, "already attached");
            return Ok((StatusCode::CREATED, Json(existing)));
        }
    }

    let detail = state
        .scanner
        .detail(runner_type, &external_id, ATTACH_HISTORY_LIMIT)
        .ok_or_else(|| ApiError::not_found(format!("External session not found: {}", external_id)))?;
    if detail.is_running {
        return Err(ApiError::invalid_state(
            "Cannot attach to a currently running session. Wait for it to finish or close it first.",
        ));
    }

    let directory = directory.trim_end_matches('/').to_string();
    let session = state
        .store
        .create_session(Some(directory), RunnerKind::Subprocess, None, None)
        .await?;

    let _guard = state.store.lock_session(&session.id).await;
    if !state
        .store
        .set_runner_session_id(&session.id, &external_id)
        .await?
    {
        // Raced with a concurrent attach of the same external id.
        state.store.delete_session(&session.id).await?;
        let existing_id = state
            .store
            .find_session_by_runner_session_id(&external_id)
            .ok_or_else(|| ApiError::internal("attach race lost and no owner found"))?;
        let existing = state
            .store
            .get_session(&existing_id)
            .ok_or_else(|| ApiError::internal("attach race lost and owner vanished"))?;
        return Ok((StatusCode::CREATED, Json(existing)));
    }

    // Attached sessions begin ready for input; the next start resumes the
    // external session through the bound id.
    let mut session = state
        .store
        .get_session(&session.id)
        .ok_or_else(|| ApiError::internal("session vanished during attach"))?;
    if let Some(first_prompt) = &detail.first_prompt {
        session.name = first_prompt.chars().take(80).collect();
    }
    session.state = SessionState::AwaitingInput;
    session.started_at = Some(now_ts());
    state.store.update_session(session.clone()).await?;
    state.store.emit_state(&session).await?;

    replay_history(&state, &session.id, &detail.messages, 0).await?;
    state
        .store
        .set_synced_message_count(&session.id, detail.messages.len());
    state.store.set_synced_turn_count(
        &session.id,
        detail.messages.iter().filter(|m| m.role == "user").count(),
    );

    info!(
        session_id = %session.id,
        external_id = %external_id,
        history_messages = detail.messages.len(),
        "attached to external session"
    );
    let session = state
        .store
        .get_session(&session.id)
        .ok_or_else(|| ApiError::internal("session vanished during attach"))?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /sessions/{id}/sync
pub async fn sync_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let _guard = state.store.lock_session(&session_id).await;
    let session = state
        .store
        .get_session(&session_id)
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    let external_id = state
        .store
        .get_runner_session_id(&session_id)
        .ok_or_else(|| ApiError::invalid_state("Session is not attached to an external session"))?;

    let detail = state
        .scanner
        .detail(ExternalRunnerType::ClaudeCode, &external_id, SYNC_HISTORY_LIMIT)
        .ok_or_else(|| ApiError::not_found(format!("External session not found: {}", external_id)))?;

    let synced = state.store.get_synced_message_count(&session_id);
    let total = detail.messages.len();

    // Cold boot: a session that was used normally has no watermark yet.
    // Adopt the current total without re-emitting anything.
    if synced == 0 && session.started_at.is_some() {
        state.store.set_synced_message_count(&session_id, total);
        state.store.set_synced_turn_count(
            &session_id,
            detail.messages.iter().filter(|m| m.role == "user").count(),
        );
        info!(session_id = %session_id, total, "initialized sync watermark");
        return Ok(Json(json!({"synced": 0, "total": total})));
    }

    // The external agent compacted its history: the watermark points past
    // the end. Adopt the current count and warn instead of wedging.
    if synced > total {
        warn!(session_id = %session_id, synced, total, "external history shrank");
        state.store.set_synced_message_count(&session_id, total);
        state
            .store
            .emit_warning(
                &session_id,
                "EXTERNAL_HISTORY_TRUNCATED",
                "The external agent compacted its history; sync watermark reset.",
            )
            .await?;
        return Ok(Json(json!({"synced": 0, "total": total})));
    }

    if synced == total {
        return Ok(Json(json!({"synced": 0, "total": total})));
    }

    replay_history(&state, &session_id, &detail.messages, synced).await?;
    state.store.set_synced_message_count(&session_id, total);
    state.store.set_synced_turn_count(
        &session_id,
        detail.messages.iter().filter(|m| m.role == "user").count(),
    );

    let new_messages = total - synced;
    info!(session_id = %session_id, new_messages, total, "synced external session");
    Ok(Json(json!({"synced": new_messages, "total": total})))
}
