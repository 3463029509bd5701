//! Event sink: the bridge from runner callbacks into the store.
//!
//! Every callback acquires the per-session lock itself. Runners are invoked
//! with the lock released, so the sink can safely transition state from
//! inside a callback without deadlocking against the caller.

use anyhow::Result;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::events::OutputKind;
use crate::session::models::SessionState;
use crate::session::state::{TransitionOpts, transition};
use crate::store::{ResolvedBy, SessionStore};

/// Translates runner callbacks into state transitions and pipeline events.
#[derive(Clone)]
pub struct EventSink {
    store: Arc<SessionStore>,
}

impl EventSink {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// The store this sink feeds.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Runner identity reported at the beginning of a turn.
    pub async fn on_header(
        &self,
        session_id: &str,
        title: &str,
        model: Option<String>,
        provider: Option<String>,
        thread_id: Option<String>,
    ) -> Result<()> {
        {
            let _guard = self.store.lock_session(session_id).await;
            if let Some(mut session) = self.store.get_session(session_id) {
                session.runner_header = Some(title.to_string());
                self.store.update_session(session).await?;
            }
        }
        self.store
            .emit_header(session_id, title, model, provider, thread_id)
            .await
    }

    /// One chunk of agent output.
    pub async fn on_output(
        &self,
        session_id: &str,
        text: &str,
        kind: OutputKind,
        is_final: Option<bool>,
    ) -> Result<()> {
        self.store.emit_output(session_id, text, kind, is_final).await
    }

    /// A streamed text delta. Deltas are forwarded live but excluded from
    /// the turn buffer; the assembled text arrives later as a regular
    /// final output.
    pub async fn on_stream_delta(&self, session_id: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.store
            .emit(
                session_id,
                crate::events::EventData::Output {
                    stream: "combined".to_string(),
                    text: text.to_string(),
                    kind: OutputKind::Step,
                    r#final: Some(false),
                    is_history: None,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn on_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
        raw: &str,
    ) -> Result<()> {
        self.store.emit_metadata(session_id, key, value, raw).await
    }

    pub async fn on_heartbeat(&self, session_id: &str, elapsed_s: f64, done: bool) -> Result<()> {
        self.store.emit_heartbeat(session_id, elapsed_s, done).await
    }

    /// A permission request the runner has already registered in the store.
    pub async fn on_permission_request(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
        suggestions: Option<Value>,
    ) -> Result<()> {
        self.store
            .emit_permission_request(session_id, request_id, tool_name, tool_input, suggestions)
            .await
    }

    pub async fn on_permission_resolved(
        &self,
        session_id: &str,
        request_id: &str,
        resolved_by: ResolvedBy,
        allowed: bool,
        message: Option<String>,
    ) -> Result<()> {
        self.store
            .emit_permission_resolved(session_id, request_id, resolved_by, allowed, message)
            .await
    }

    /// Runner failure: move the session to ERROR (when legal) and journal
    /// the error.
    pub async fn on_error(&self, session_id: &str, code: &str, message: &str) -> Result<()> {
        {
            let _guard = self.store.lock_session(session_id).await;
            if let Some(mut session) = self.store.get_session(session_id) {
                if session.state != SessionState::Error {
                    match transition(
                        &mut session,
                        SessionState::Error,
                        TransitionOpts {
                            ended_at: true,
                            ..Default::default()
                        },
                    ) {
                        Ok(()) => {
                            self.store.update_session(session.clone()).await?;
                            self.store.emit_state(&session).await?;
                        }
                        Err(err) => {
                            // CREATED cannot fail into ERROR; journal only.
                            debug!("Skipping error transition for {}: {}", session_id, err);
                        }
                    }
                }
            }
        }
        self.store.emit_error(session_id, code, message).await
    }

    /// The runner exited deliberately (stop honored or hard exit).
    pub async fn on_exit(&self, session_id: &str, exit_code: Option<i64>) -> Result<()> {
        let _guard = self.store.lock_session(session_id).await;
        self.store.clear_process(session_id);
        self.store.clear_stop_requested(session_id);
        let Some(mut session) = self.store.get_session(session_id) else {
            return Ok(());
        };
        if !session.state.is_active() {
            debug!("on_exit in state {}; nothing to do", session.state);
            return Ok(());
        }
        if let Err(err) = transition(
            &mut session,
            SessionState::AwaitingInput,
            TransitionOpts {
                ended_at: true,
                exit_code,
                ..Default::default()
            },
        ) {
            warn!("Exit transition failed for {}: {}", session_id, err);
            return Ok(());
        }
        self.store.update_session(session.clone()).await?;
        self.store.emit_state(&session).await?;
        Ok(())
    }

    /// The turn finished naturally; the session now waits for input.
    pub async fn on_awaiting_input(&self, session_id: &str) -> Result<()> {
        let _guard = self.store.lock_session(session_id).await;
        self.store.clear_process(session_id);
        let Some(mut session) = self.store.get_session(session_id) else {
            return Ok(());
        };
        if session.state == SessionState::AwaitingInput {
            return Ok(());
        }
        if !session.state.is_active() {
            debug!("on_awaiting_input in state {}; ignoring", session.state);
            return Ok(());
        }
        if let Err(err) = transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default())
        {
            warn!("Awaiting-input transition failed for {}: {}", session_id, err);
            return Ok(());
        }
        self.store.update_session(session.clone()).await?;
        self.store.emit_state(&session).await?;
        Ok(())
    }
}
