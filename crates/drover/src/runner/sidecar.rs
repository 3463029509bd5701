//! Sidecar runner: delegates execution to a long-lived out-of-process
//! service.
//!
//! Control operations are POSTs; events arrive on a per-session SSE stream.
//! The stream reader survives transient connection loss with exponential
//! backoff (0.5 s doubling to a 5 s cap) and applies a per-read timeout
//! longer than the sidecar's heartbeat interval; a timed-out read surfaces
//! as a `READ_TIMEOUT` error event and the reader reconnects.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::sink::EventSink;
use super::{Runner, RunnerError};
use crate::events::OutputKind;
use crate::session::models::{ApprovalMode, RunnerKind};
use crate::store::{PermissionDecision, ResolvedBy, SessionStore};
use crate::util::new_id;

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Reconnect delay cap.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Configuration for the sidecar runner.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Base URL of the sidecar service.
    pub base_url: String,
    /// Shared token sent as `X-Sidecar-Token`.
    pub token: Option<String>,
    /// Per-read timeout on the SSE stream.
    pub read_timeout: Duration,
    /// Pending permission requests resolve as deny after this long.
    pub permission_timeout: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8788".to_string(),
            token: None,
            read_timeout: Duration::from_secs(60),
            permission_timeout: Duration::from_secs(300),
        }
    }
}

/// One structured event from the sidecar stream.
#[derive(Debug, Deserialize)]
struct SidecarEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

/// Runner that drives a sidecar service over HTTP + SSE.
pub struct SidecarRunner {
    store: Arc<SessionStore>,
    sink: EventSink,
    config: SidecarConfig,
    client: reqwest::Client,
    streams: DashMap<String, JoinHandle<()>>,
    /// Self-reference handed to stream reader tasks.
    weak: Weak<Self>,
}

impl SidecarRunner {
    pub fn new(store: Arc<SessionStore>, sink: EventSink, config: SidecarConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new_cyclic(|weak| Self {
            store,
            sink,
            config,
            client,
            streams: DashMap::new(),
            weak: weak.clone(),
        })
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<(), RunnerError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut request = self.client.post(&url).json(payload);
        if let Some(token) = &self.config.token {
            request = request.header("X-Sidecar-Token", token);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_connect() || err.is_timeout() {
                RunnerError::Unavailable(format!("sidecar unreachable at {}: {}", url, err))
            } else {
                RunnerError::Failed(anyhow!("sidecar request {} failed: {}", path, err))
            }
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::Failed(anyhow!(
                "sidecar {} returned {}: {}",
                path,
                status,
                body
            )));
        }
        Ok(())
    }

    /// Start SSE consumption for a session if not already running.
    fn ensure_stream(&self, session_id: &str) {
        if self.streams.contains_key(session_id) {
            return;
        }
        let Some(runner) = self.weak.upgrade() else {
            return;
        };
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            runner.consume_stream(&id).await;
        });
        self.streams.insert(session_id.to_string(), handle);
    }

    /// Read the session's event stream until the task is aborted,
    /// reconnecting with backoff on every failure.
    async fn consume_stream(self: Arc<Self>, session_id: &str) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.read_stream_once(session_id).await {
                Ok(()) => {
                    // Clean close; the sidecar dropped us. Reconnect quickly.
                    debug!("Sidecar stream closed for {}", session_id);
                    backoff = BACKOFF_INITIAL;
                }
                Err(err) => {
                    warn!("Sidecar stream for {} failed: {}", session_id, err);
                    let _ = self
                        .sink
                        .on_error(session_id, "STREAM_ERROR", &err.to_string())
                        .await;
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn read_stream_once(&self, session_id: &str) -> anyhow::Result<()> {
        let url = format!("{}/events/{}", self.config.base_url, session_id);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.header("X-Sidecar-Token", token);
        }

        let mut source = reqwest_eventsource::EventSource::new(request)
            .context("opening sidecar event stream")?;

        loop {
            let next = match timeout(self.config.read_timeout, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "Sidecar read timeout for {} after {:?}",
                        session_id, self.config.read_timeout
                    );
                    let _ = self
                        .sink
                        .on_error(session_id, "READ_TIMEOUT", "Sidecar stream timed out")
                        .await;
                    source.close();
                    return Ok(());
                }
            };
            match next {
                Some(Ok(reqwest_eventsource::Event::Open)) => {}
                Some(Ok(reqwest_eventsource::Event::Message(message))) => {
                    let event: SidecarEvent = match serde_json::from_str(&message.data) {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    self.dispatch(session_id, event).await;
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    source.close();
                    return Ok(());
                }
                Some(Err(err)) => {
                    source.close();
                    return Err(anyhow!("sidecar stream error: {}", err));
                }
                None => return Ok(()),
            }
        }
    }

    /// Route one structured sidecar event to the sink.
    async fn dispatch(&self, session_id: &str, event: SidecarEvent) {
        let data = event.data;
        match event.event_type.as_str() {
            "header" => {
                let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                if !text.is_empty() {
                    let _ = self
                        .sink
                        .on_output(session_id, text, OutputKind::Header, None)
                        .await;
                }
            }
            "output" => {
                let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let kind = match data.get("kind").and_then(|v| v.as_str()) {
                    Some("final") => OutputKind::Final,
                    Some("header") => OutputKind::Header,
                    _ => OutputKind::Step,
                };
                let is_final = data.get("final").and_then(|v| v.as_bool());
                let _ = self.sink.on_output(session_id, text, kind, is_final).await;
            }
            "metadata" => {
                let Some(key) = data.get("key").and_then(|v| v.as_str()) else {
                    return;
                };
                let value = data.get("value").cloned().unwrap_or(Value::Null);
                let raw = data.get("raw").and_then(|v| v.as_str()).unwrap_or("");
                let _ = self.sink.on_metadata(session_id, key, value, raw).await;
            }
            "heartbeat" => {
                let elapsed = data.get("elapsed_s").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let done = data.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
                let _ = self.sink.on_heartbeat(session_id, elapsed, done).await;
            }
            "error" => {
                let code = data
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("SIDECAR_ERROR");
                let message = data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error");
                let _ = self.sink.on_error(session_id, code, message).await;
            }
            "permission_request" => {
                self.handle_permission_request(session_id, data).await;
            }
            "exit" => {
                let exit_code = data.get("exit_code").and_then(|v| v.as_i64());
                // A requested stop or a non-zero code is a real exit;
                // otherwise the agent finished a turn and awaits input.
                if self.store.is_stop_requested(session_id)
                    || exit_code.is_some_and(|code| code != 0)
                {
                    let _ = self.sink.on_exit(session_id, exit_code).await;
                } else {
                    let _ = self.sink.on_awaiting_input(session_id).await;
                }
            }
            other => {
                debug!("Ignoring sidecar event type {} for {}", other, session_id);
            }
        }
    }

    /// Register the one-shot, surface the request, and POST the decision
    /// back to the sidecar once resolved.
    async fn handle_permission_request(&self, session_id: &str, data: Value) {
        let request_id = data
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| new_id("perm"));
        let tool_name = data
            .get("tool_name")
            .and_then(|v| v.as_str())
            .unwrap_or("approval")
            .to_string();
        let tool_input = data.get("tool_input").cloned().unwrap_or(Value::Null);

        let rx = self.store.add_pending_permission(
            session_id,
            &request_id,
            &tool_name,
            tool_input.clone(),
        );
        let _ = self
            .sink
            .on_permission_request(session_id, &request_id, &tool_name, tool_input, None)
            .await;

        let store = self.store.clone();
        let sink = self.sink.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let decision = match timeout(config.permission_timeout, rx).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => {
                    let _ = sink
                        .on_permission_resolved(
                            &session_id,
                            &request_id,
                            ResolvedBy::Cancelled,
                            false,
                            Some("Session was interrupted".to_string()),
                        )
                        .await;
                    return;
                }
                Err(_) => {
                    store.resolve_pending_permission(
                        &session_id,
                        &request_id,
                        PermissionDecision::denied(ResolvedBy::Timeout, "Timeout"),
                    );
                    let _ = sink
                        .on_permission_resolved(
                            &session_id,
                            &request_id,
                            ResolvedBy::Timeout,
                            false,
                            Some("Permission request timed out".to_string()),
                        )
                        .await;
                    PermissionDecision::denied(ResolvedBy::Timeout, "Timeout")
                }
            };

            // The resolver already journalled permission_resolved; this task
            // only relays the decision. Cancellation means teardown.
            if decision.resolved_by == ResolvedBy::Cancelled {
                return;
            }

            let payload = json!({
                "session_id": session_id,
                "request_id": request_id,
                "allow": decision.allow,
                "message": decision.message,
                "updated_input": decision.updated_input,
            });
            let url = format!("{}/sessions/permission", config.base_url);
            let mut request = client.post(&url).json(&payload);
            if let Some(token) = &config.token {
                request = request.header("X-Sidecar-Token", token);
            }
            if let Err(err) = request.send().await {
                warn!(
                    "Posting permission decision for {} failed: {}",
                    session_id, err
                );
            }
        });
    }
}

#[async_trait]
impl Runner for SidecarRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Sidecar
    }

    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.store.clear_stop_requested(session_id);
        self.store.clear_last_output(session_id);
        let payload = json!({
            "session_id": session_id,
            "prompt": prompt,
            "approval_choice": mode.as_choice(),
        });
        self.post_json("/sessions/start", &payload).await?;
        self.ensure_stream(session_id);
        Ok(())
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        let payload = json!({"session_id": session_id, "text": text});
        self.post_json("/sessions/input", &payload).await?;
        self.ensure_stream(session_id);
        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<Option<i64>, RunnerError> {
        self.store.request_stop(session_id);
        for request_id in self.store.clear_pending_permissions(session_id) {
            let _ = self
                .sink
                .on_permission_resolved(
                    session_id,
                    &request_id,
                    ResolvedBy::Cancelled,
                    false,
                    Some("Session was interrupted".to_string()),
                )
                .await;
        }
        let payload = json!({"session_id": session_id});
        self.post_json("/sessions/stop", &payload).await?;
        if let Some((_, handle)) = self.streams.remove(session_id) {
            handle.abort();
        }
        Ok(None)
    }

    async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        let payload = json!({
            "session_id": session_id,
            "approval_choice": mode.as_choice(),
        });
        self.post_json("/sessions/approval", &payload).await?;
        info!("Updated sidecar permission mode for {} to {}", session_id, mode);
        Ok(())
    }
}
