//! In-process API runner: drives a conversation loop directly against an
//! LLM provider's messages endpoint.
//!
//! Messages are persisted in the store. A turn loops: call the model; if it
//! emits tool_use blocks, each one is executed through the host
//! [`ToolDispatcher`], the results recorded as a user-role tool_result
//! message, and the loop iterates; otherwise the turn ends. Streamed text
//! deltas are forwarded live; the assembled final text is stored.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use super::sink::EventSink;
use super::{Runner, RunnerError};
use crate::events::OutputKind;
use crate::session::models::{ApprovalMode, RunnerKind};
use crate::store::{PermissionDecision, ResolvedBy, SessionStore};
use crate::util::new_id;

/// Tools auto-approved under accept-edits.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];

/// Executes tools on behalf of the conversation loop. The broker core never
/// executes tools itself; hosts provide an implementation.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Tool definitions advertised to the model.
    fn definitions(&self) -> Value;

    /// Run one tool and return its result content.
    async fn execute(&self, name: &str, input: &Value) -> Result<String>;
}

/// Default dispatcher: advertises nothing and refuses everything.
#[derive(Debug, Default)]
pub struct DenyAllTools;

#[async_trait]
impl ToolDispatcher for DenyAllTools {
    fn definitions(&self) -> Value {
        Value::Array(Vec::new())
    }

    async fn execute(&self, name: &str, _input: &Value) -> Result<String> {
        Err(anyhow!("no tool host configured for {}", name))
    }
}

/// Configuration for the in-process API runner.
#[derive(Debug, Clone)]
pub struct ApiRunnerConfig {
    /// Messages endpoint base URL.
    pub base_url: String,
    /// Provider API key; resolved from the environment at startup.
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub heartbeat_interval: Duration,
    pub permission_timeout: Duration,
}

impl Default for ApiRunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            heartbeat_interval: Duration::from_secs(5),
            permission_timeout: Duration::from_secs(300),
        }
    }
}

/// What one streamed model response boiled down to.
struct ModelTurn {
    blocks: Vec<Value>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

/// Runner that loops against the provider API in-process.
pub struct ApiRunner {
    store: Arc<SessionStore>,
    sink: EventSink,
    config: ApiRunnerConfig,
    client: reqwest::Client,
    tools: Arc<dyn ToolDispatcher>,
    tasks: DashMap<String, JoinHandle<()>>,
    modes: DashMap<String, ApprovalMode>,
    weak: std::sync::Weak<Self>,
}

impl ApiRunner {
    pub fn new(
        store: Arc<SessionStore>,
        sink: EventSink,
        config: ApiRunnerConfig,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            sink,
            config,
            client: reqwest::Client::new(),
            tools,
            tasks: DashMap::new(),
            modes: DashMap::new(),
            weak: weak.clone(),
        })
    }

    fn mode(&self, session_id: &str) -> ApprovalMode {
        self.modes
            .get(session_id)
            .map(|m| *m)
            .or_else(|| self.store.get_session(session_id).map(|s| s.approval_mode))
            .unwrap_or_default()
    }

    fn spawn_loop(&self, session_id: &str) {
        let Some(runner) = self.weak.upgrade() else {
            return;
        };
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            runner.conversation_loop(&id).await;
        });
        self.tasks.insert(session_id.to_string(), handle);
    }

    fn loop_active(&self, session_id: &str) -> bool {
        self.tasks
            .get(session_id)
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// The agentic loop for one turn (possibly several model calls).
    async fn conversation_loop(self: Arc<Self>, session_id: &str) {
        let started = Instant::now();
        let heartbeat = {
            let sink = self.sink.clone();
            let id = session_id.to_string();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let _ = sink
                        .on_heartbeat(&id, started.elapsed().as_secs_f64(), false)
                        .await;
                }
            })
        };

        let outcome = self.run_turns(session_id).await;
        heartbeat.abort();
        let _ = self
            .sink
            .on_heartbeat(session_id, started.elapsed().as_secs_f64(), true)
            .await;

        match outcome {
            Ok(()) => {
                if self.store.is_stop_requested(session_id) {
                    let _ = self.sink.on_exit(session_id, Some(0)).await;
                } else {
                    let _ = self.sink.on_awaiting_input(session_id).await;
                }
            }
            Err(err) => {
                warn!("Conversation loop for {} failed: {}", session_id, err);
                let _ = self
                    .sink
                    .on_error(session_id, "API_ERROR", &err.to_string())
                    .await;
            }
        }
        self.tasks.remove(session_id);
        self.store.clear_stop_requested(session_id);
    }

    async fn run_turns(&self, session_id: &str) -> Result<()> {
        while !self.store.is_stop_requested(session_id) {
            let messages = self.store.conversation(session_id).await?;
            let turn = self.stream_model_turn(session_id, messages).await?;

            self.store
                .add_message(session_id, "assistant", Value::Array(turn.blocks.clone()))
                .await?;

            if turn.input_tokens > 0 || turn.output_tokens > 0 {
                let _ = self
                    .sink
                    .on_metadata(
                        session_id,
                        "tokens",
                        json!({"input": turn.input_tokens, "output": turn.output_tokens}),
                        &format!(
                            "input: {}, output: {}",
                            turn.input_tokens, turn.output_tokens
                        ),
                    )
                    .await;
            }

            let tool_uses: Vec<&Value> = turn
                .blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
                .collect();
            if turn.stop_reason.as_deref() != Some("tool_use") || tool_uses.is_empty() {
                // Final assembled text for the turn.
                let text = turn
                    .blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    self.sink
                        .on_output(session_id, &text, OutputKind::Final, Some(true))
                        .await?;
                }
                return Ok(());
            }

            let mut results = Vec::new();
            for block in tool_uses {
                if self.store.is_stop_requested(session_id) {
                    return Ok(());
                }
                results.push(self.run_tool(session_id, block).await?);
            }
            self.store
                .add_message(session_id, "user", Value::Array(results))
                .await?;
        }
        Ok(())
    }

    /// Execute one tool_use block, honoring the permission round-trip.
    async fn run_tool(&self, session_id: &str, block: &Value) -> Result<Value> {
        let tool_id = block
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = block
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let input = block.get("input").cloned().unwrap_or(Value::Null);

        let allowed = self.check_permission(session_id, &name, &input).await;
        let (content, is_error) = if !allowed {
            ("Permission denied".to_string(), true)
        } else {
            match self.tools.execute(&name, &input).await {
                Ok(content) => {
                    let _ = self
                        .sink
                        .on_output(
                            session_id,
                            &format!("[tool: {}]\n", name),
                            OutputKind::Step,
                            Some(false),
                        )
                        .await;
                    (content, false)
                }
                Err(err) => (err.to_string(), true),
            }
        };
        Ok(json!({
            "type": "tool_result",
            "tool_use_id": tool_id,
            "content": content,
            "is_error": is_error,
        }))
    }

    /// In-process permission round-trip: register the one-shot, emit the
    /// request, and block the tool call until it resolves.
    async fn check_permission(&self, session_id: &str, name: &str, input: &Value) -> bool {
        let mode = self.mode(session_id);
        let request_id = new_id("perm");
        match mode {
            ApprovalMode::Bypass => {
                let _ = self
                    .sink
                    .on_permission_resolved(session_id, &request_id, ResolvedBy::Auto, true, None)
                    .await;
                return true;
            }
            ApprovalMode::AcceptEdits if EDIT_TOOLS.contains(&name) => {
                let _ = self
                    .sink
                    .on_permission_resolved(session_id, &request_id, ResolvedBy::Auto, true, None)
                    .await;
                return true;
            }
            _ => {}
        }

        let rx =
            self.store
                .add_pending_permission(session_id, &request_id, name, input.clone());
        let _ = self
            .sink
            .on_permission_request(session_id, &request_id, name, input.clone(), None)
            .await;

        match timeout(self.config.permission_timeout, rx).await {
            // The resolver already journalled permission_resolved.
            Ok(Ok(decision)) => decision.allow,
            Ok(Err(_)) => {
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
                false
            }
            Err(_) => {
                self.store.resolve_pending_permission(
                    session_id,
                    &request_id,
                    PermissionDecision::denied(ResolvedBy::Timeout, "Timeout"),
                );
                let _ = self
                    .sink
                    .on_permission_resolved(
                        session_id,
                        &request_id,
                        ResolvedBy::Timeout,
                        false,
                        Some("Permission request timed out".to_string()),
                    )
                    .await;
                false
            }
        }
    }

    /// One streamed model call. Text deltas are forwarded as they arrive.
    async fn stream_model_turn(
        &self,
        session_id: &str,
        messages: Vec<Value>,
    ) -> Result<ModelTurn> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .context("no API key configured")?;

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "stream": true,
            "messages": messages,
            "tools": self.tools.definitions(),
        });
        let request = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);

        let mut source = reqwest_eventsource::EventSource::new(request)
            .context("opening model stream")?;

        let mut turn = ModelTurn {
            blocks: Vec::new(),
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
        };
        // (block json, accumulated text or partial tool input json)
        let mut open_block: Option<(Value, String)> = None;

        while let Some(item) = source.next().await {
            let message = match item {
                Ok(reqwest_eventsource::Event::Open) => continue,
                Ok(reqwest_eventsource::Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(err) => {
                    source.close();
                    return Err(anyhow!("model stream failed: {}", err));
                }
            };
            let data: Value = match serde_json::from_str(&message.data) {
                Ok(data) => data,
                Err(_) => continue,
            };
            match message.event.as_str() {
                "message_start" => {
                    turn.input_tokens = data
                        .pointer("/message/usage/input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
                "content_block_start" => {
                    let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                    open_block = Some((block, String::new()));
                }
                "content_block_delta" => {
                    let Some((_, acc)) = open_block.as_mut() else {
                        continue;
                    };
                    match data.pointer("/delta/type").and_then(|v| v.as_str()) {
                        Some("text_delta") => {
                            let delta = data
                                .pointer("/delta/text")
                                .and_then(|v| v.as_str())
                                .unwrap_or("");
                            acc.push_str(delta);
                            self.sink.on_stream_delta(session_id, delta).await?;
                        }
                        Some("input_json_delta") => {
                            let delta = data
                                .pointer("/delta/partial_json")
                                .and_then(|v| v.as_str())
                                .unwrap_or("");
                            acc.push_str(delta);
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    if let Some((mut block, acc)) = open_block.take() {
                        match block.get("type").and_then(|t| t.as_str()) {
                            Some("text") => {
                                block["text"] = Value::String(acc);
                            }
                            Some("tool_use") => {
                                let input: Value =
                                    serde_json::from_str(&acc).unwrap_or(json!({}));
                                block["input"] = input;
                            }
                            Some("thinking") => {
                                block["thinking"] = Value::String(acc.clone());
                                if !acc.is_empty() {
                                    self.sink
                                        .on_output(
                                            session_id,
                                            &format!("[thinking] {}\n", acc),
                                            OutputKind::Step,
                                            Some(false),
                                        )
                                        .await?;
                                }
                            }
                            _ => {}
                        }
                        turn.blocks.push(block);
                    }
                }
                "message_delta" => {
                    if let Some(reason) = data.pointer("/delta/stop_reason").and_then(|v| v.as_str())
                    {
                        turn.stop_reason = Some(reason.to_string());
                    }
                    if let Some(output) = data.pointer("/usage/output_tokens").and_then(|v| v.as_u64())
                    {
                        turn.output_tokens = output;
                    }
                }
                "message_stop" => break,
                "error" => {
                    source.close();
                    let message = data
                        .pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("model error");
                    return Err(anyhow!("{}", message));
                }
                other => {
                    debug!("Ignoring model stream event {}", other);
                }
            }
        }
        source.close();
        Ok(turn)
    }
}

#[async_trait]
impl Runner for ApiRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Api
    }

    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        if self.config.api_key.is_none() {
            return Err(RunnerError::Unavailable(
                "no provider API key configured".to_string(),
            ));
        }
        self.modes.insert(session_id.to_string(), mode);
        self.store.clear_stop_requested(session_id);

        self.sink
            .on_header(
                session_id,
                "Provider API",
                Some(self.config.model.clone()),
                Some("api".to_string()),
                None,
            )
            .await
            .map_err(RunnerError::Failed)?;

        self.store
            .add_message(
                session_id,
                "user",
                json!([{"type": "text", "text": prompt}]),
            )
            .await
            .map_err(RunnerError::Failed)?;
        self.spawn_loop(session_id);
        Ok(())
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.store
            .add_message(session_id, "user", json!([{"type": "text", "text": text}]))
            .await
            .map_err(RunnerError::Failed)?;
        if !self.loop_active(session_id) {
            self.store.clear_stop_requested(session_id);
            self.spawn_loop(session_id);
        }
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
        if let Some((_, handle)) = self.tasks.remove(session_id) {
            handle.abort();
            let _ = timeout(Duration::from_secs(5), async {
                // Aborted tasks finish promptly; this bounds the wait.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
        }
        self.store.clear_stop_requested(session_id);
        info!("Stopped API conversation loop for {}", session_id);
        Ok(Some(0))
    }

    async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.modes.insert(session_id.to_string(), mode);
        Ok(())
    }
}
