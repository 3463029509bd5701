//! Subprocess-per-turn runner.
//!
//! Spawns a short-lived worker process for each turn and speaks the
//! `drover-runner-protocol` over its stdin/stdout. Stderr is diagnostic
//! only. After the child exits the runner either respawns with the next
//! queued input, reports an exit (stop was requested) or reports
//! awaiting-input.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::{Instant, timeout};

use drover_runner_protocol::{
    ContentBlock, PermissionResponseCommand, StartCommand, WorkerCommand, WorkerEvent,
    decode_event, encode_command,
};

use super::sink::EventSink;
use super::{Runner, RunnerError};
use crate::discovery::running::is_external_session_running;
use crate::events::OutputKind;
use crate::session::models::{ApprovalMode, RunnerKind};
use crate::store::{PermissionDecision, ResolvedBy, SessionStore};
use crate::util::new_id;

/// How long a child gets to exit after a stop command.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Reap timeout after stdout closes.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tool results forwarded to the UI are clipped to this many characters.
const TOOL_RESULT_PREVIEW: usize = 500;

/// Worker stderr noise that is not worth logging.
const IGNORED_STDERR_SUBSTRINGS: &[&str] = &[
    "ExperimentalWarning",
    "DeprecationWarning",
    "(Use `node --trace",
];

/// Configuration for the subprocess runner.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Worker command line: program followed by arguments.
    pub command: Vec<String>,
    /// Pending permission requests resolve as deny after this long.
    pub permission_timeout: Duration,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            command: vec!["drover-worker".to_string()],
            permission_timeout: Duration::from_secs(300),
        }
    }
}

struct ActiveTurn {
    stdin: Arc<Mutex<ChildStdin>>,
    kill: Arc<Notify>,
    done: watch::Receiver<bool>,
}

/// Runner that spawns one worker process per turn.
pub struct SubprocessRunner {
    store: Arc<SessionStore>,
    sink: EventSink,
    config: SubprocessConfig,
    turns: DashMap<String, ActiveTurn>,
    /// In-memory cache of the bound external id, refreshed on init events.
    external_ids: DashMap<String, String>,
    modes: DashMap<String, ApprovalMode>,
    /// Serializes spawn-vs-queue decisions per session.
    spawn_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Self-reference handed to reader tasks.
    weak: Weak<Self>,
}

impl SubprocessRunner {
    pub fn new(store: Arc<SessionStore>, sink: EventSink, config: SubprocessConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            sink,
            config,
            turns: DashMap::new(),
            external_ids: DashMap::new(),
            modes: DashMap::new(),
            spawn_locks: DashMap::new(),
            weak: weak.clone(),
        })
    }

    fn spawn_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.spawn_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn resume_hint(&self, session_id: &str) -> Option<String> {
        if let Some(cached) = self.external_ids.get(session_id) {
            return Some(cached.clone());
        }
        let bound = self.store.get_runner_session_id(session_id)?;
        self.external_ids
            .insert(session_id.to_string(), bound.clone());
        Some(bound)
    }

    /// Drop the resume hint when the external session is busy in another
    /// CLI process. Resuming a busy session fails hard; starting fresh lets
    /// the init event rebind.
    async fn maybe_drop_busy_resume(
        &self,
        session_id: &str,
        resume: Option<String>,
    ) -> Option<String> {
        let resume = resume?;
        // Our own worker just exited; no need to scan processes.
        if self.turns.contains_key(session_id) {
            return Some(resume);
        }
        if is_external_session_running(&resume) {
            warn!(
                "External session {} busy in another CLI; starting {} without resume",
                resume, session_id
            );
            let _ = self
                .store
                .emit_warning(
                    session_id,
                    "EXTERNAL_SESSION_BUSY",
                    "The attached agent session is currently running in another CLI; \
                     starting a fresh turn without resume.",
                )
                .await;
            return None;
        }
        Some(resume)
    }

    /// Boxed wrapper around [`Self::spawn_turn_inner`]. `read_events` calls
    /// this recursively to respawn the next queued turn; without the
    /// explicit boxing here, rustc cannot prove the `tokio::spawn`ed future
    /// in `read_events` is `Send` because the two functions' futures refer
    /// to each other.
    fn spawn_turn<'a>(
        &'a self,
        session_id: &'a str,
        prompt: &'a str,
        mode: ApprovalMode,
        resume: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RunnerError>> + Send + 'a>>
    {
        Box::pin(self.spawn_turn_inner(session_id, prompt, mode, resume))
    }

    async fn spawn_turn_inner(
        &self,
        session_id: &str,
        prompt: &str,
        mode: ApprovalMode,
        resume: Option<String>,
    ) -> Result<(), RunnerError> {
        let program = self
            .config
            .command
            .first()
            .ok_or_else(|| RunnerError::Unavailable("no worker command configured".to_string()))?;

        let session = self.store.get_session(session_id);
        let cwd = session.and_then(|s| s.directory);

        let mut command = Command::new(program);
        command
            .args(&self.config.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                RunnerError::Unavailable(format!("worker {:?}: {}", program, err))
            }
            _ => RunnerError::Failed(anyhow!("spawning worker {:?}: {}", program, err)),
        })?;

        if let Some(pid) = child.id() {
            self.store.set_process(session_id, pid);
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Failed(anyhow!("worker stdin not piped")))?;
        let stdin = Arc::new(Mutex::new(stdin));

        let start = WorkerCommand::Start(StartCommand {
            prompt: prompt.to_string(),
            cwd: cwd.clone(),
            permission_mode: mode.worker_mode().to_string(),
            resume,
        });
        Self::write_command(&stdin, &start)
            .await
            .map_err(RunnerError::Failed)?;

        let kill = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(false);
        self.turns.insert(
            session_id.to_string(),
            ActiveTurn {
                stdin: stdin.clone(),
                kill: kill.clone(),
                done: done_rx,
            },
        );

        let Some(runner) = self.weak.upgrade() else {
            self.turns.remove(session_id);
            return Err(RunnerError::Failed(anyhow!("runner shutting down")));
        };
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            runner
                .read_events(&session_id, child, stdin, kill, done_tx, mode)
                .await;
        });
        Ok(())
    }

    async fn write_command(stdin: &Arc<Mutex<ChildStdin>>, cmd: &WorkerCommand) -> Result<()> {
        let line = encode_command(cmd).context("encoding worker command")?;
        let mut guard = stdin.lock().await;
        guard
            .write_all(line.as_bytes())
            .await
            .context("writing worker command")?;
        guard.flush().await.context("flushing worker stdin")?;
        Ok(())
    }

    /// Read JSON-line events from the child until stdout closes, then reap
    /// the child and decide the turn boundary. Every exit path reaps: the
    /// child can never be left as a zombie.
    async fn read_events(
        self: Arc<Self>,
        session_id: &str,
        mut child: Child,
        stdin: Arc<Mutex<ChildStdin>>,
        kill: Arc<Notify>,
        done_tx: watch::Sender<bool>,
        mode: ApprovalMode,
    ) {
        let started = Instant::now();
        let stdout = child.stdout.take();
        let mut killed = false;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match decode_event(&line) {
                                Ok(event) => {
                                    self.handle_event(session_id, Some(&stdin), event).await;
                                }
                                Err(err) => {
                                    warn!(
                                        "Malformed worker event for {}: {} ({})",
                                        session_id,
                                        &line.chars().take(200).collect::<String>(),
                                        err
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("Worker stdout read failed for {}: {}", session_id, err);
                            break;
                        }
                    },
                    _ = kill.notified() => {
                        warn!("Killing worker for {} (stop grace expired)", session_id);
                        let _ = child.start_kill();
                        killed = true;
                    }
                }
            }
        }

        // Reap. A child that ignores stdout closure gets killed after the
        // timeout so no zombie survives this function.
        let exit_code = match timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.code().map(i64::from),
            Ok(Err(err)) => {
                warn!("Waiting for worker of {} failed: {}", session_id, err);
                None
            }
            Err(_) => {
                let _ = child.start_kill();
                killed = true;
                match timeout(Duration::from_secs(2), child.wait()).await {
                    Ok(Ok(status)) => status.code().map(i64::from),
                    _ => None,
                }
            }
        };

        self.drain_stderr(session_id, &mut child).await;

        let elapsed = started.elapsed().as_secs_f64();
        let _ = self.sink.on_heartbeat(session_id, elapsed, true).await;

        self.turns.remove(session_id);
        self.store.clear_process(session_id);
        let _ = done_tx.send(true);
        if killed {
            debug!("Worker for {} exited after kill", session_id);
        }

        // Turn boundary: queued input respawns immediately, a stop request
        // is an exit, anything else awaits input.
        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;
        if !self.store.is_stop_requested(session_id) {
            if let Some(next) = self.store.pop_next_pending_input(session_id) {
                let resume = self.resume_hint(session_id);
                if let Err(err) = self.spawn_turn(session_id, &next, mode, resume).await {
                    warn!("Respawn for {} failed: {}", session_id, err);
                    let _ = self
                        .sink
                        .on_error(session_id, "RUNNER_ERROR", &err.to_string())
                        .await;
                }
                return;
            }
            let _ = self.sink.on_awaiting_input(session_id).await;
            return;
        }
        let _ = self.sink.on_exit(session_id, exit_code).await;
    }

    async fn drain_stderr(&self, session_id: &str, child: &mut Child) {
        let Some(mut stderr) = child.stderr.take() else {
            return;
        };
        let mut buf = Vec::new();
        if timeout(Duration::from_secs(2), stderr.read_to_end(&mut buf))
            .await
            .is_err()
        {
            return;
        }
        for line in String::from_utf8_lossy(&buf).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if IGNORED_STDERR_SUBSTRINGS.iter().any(|s| line.contains(s)) {
                continue;
            }
            debug!("Worker stderr [{}]: {}", session_id, line);
        }
    }

    async fn handle_event(
        &self,
        session_id: &str,
        stdin: Option<&Arc<Mutex<ChildStdin>>>,
        event: WorkerEvent,
    ) {
        match event {
            WorkerEvent::Init(init) => {
                if let Some(external_id) = init.session_id.as_deref() {
                    if let Err(err) = self.bind_external_id(session_id, external_id).await {
                        warn!("Binding external id for {} failed: {}", session_id, err);
                    }
                }
                let model = init.model.clone();
                let title = match init.version.as_deref() {
                    Some(version) if !version.is_empty() => format!("Agent worker {}", version),
                    _ => "Agent worker".to_string(),
                };
                let _ = self
                    .sink
                    .on_header(session_id, &title, model, Some("subprocess".to_string()), None)
                    .await;
            }
            WorkerEvent::Output(output) => {
                for (text, kind, is_final) in classify_blocks(&output.blocks) {
                    let _ = self
                        .sink
                        .on_output(session_id, &text, kind, Some(is_final))
                        .await;
                }
            }
            WorkerEvent::Result(result) => {
                if result.input_tokens > 0 || result.output_tokens > 0 {
                    let _ = self
                        .sink
                        .on_metadata(
                            session_id,
                            "tokens",
                            json!({"input": result.input_tokens, "output": result.output_tokens}),
                            &format!(
                                "input: {}, output: {}",
                                result.input_tokens, result.output_tokens
                            ),
                        )
                        .await;
                }
                if let Some(cost) = result.cost_usd {
                    let _ = self
                        .sink
                        .on_metadata(session_id, "cost", json!(cost), &format!("${:.4}", cost))
                        .await;
                }
                if result.is_error {
                    let message = result
                        .error_text
                        .unwrap_or_else(|| "Unknown worker error".to_string());
                    let _ = self.sink.on_error(session_id, "RESULT_ERROR", &message).await;
                }
            }
            WorkerEvent::PermissionRequest(request) => {
                self.handle_permission_request(session_id, stdin, request)
                    .await;
            }
            WorkerEvent::Heartbeat(hb) => {
                let _ = self.sink.on_heartbeat(session_id, hb.elapsed_s, false).await;
            }
            WorkerEvent::Stderr(err) => {
                debug!("Worker stderr [{}]: {}", session_id, err.line);
            }
            WorkerEvent::Error(err) => {
                let code = err.code.unwrap_or_else(|| "WORKER_ERROR".to_string());
                let message = err.message.unwrap_or_else(|| "Unknown error".to_string());
                let _ = self.sink.on_error(session_id, &code, &message).await;
            }
        }
    }

    /// Bind or rebind the external session id reported by an init event.
    ///
    /// A differing id means the agent silently expired the old session and
    /// issued a successor; the binding follows it and a warning is
    /// journalled so operators can see the rebind.
    async fn bind_external_id(&self, session_id: &str, external_id: &str) -> Result<()> {
        let expected = self
            .external_ids
            .get(session_id)
            .map(|v| v.clone())
            .or_else(|| self.store.get_runner_session_id(session_id));

        match expected {
            Some(expected) if expected != external_id => {
                info!(
                    "External session for {} expired ({} -> {}); rebinding",
                    session_id, expected, external_id
                );
                self.external_ids
                    .insert(session_id.to_string(), external_id.to_string());
                self.store
                    .replace_runner_session_id(session_id, &expected, external_id)
                    .await?;
                self.store
                    .emit_warning(
                        session_id,
                        "EXTERNAL_SESSION_REBOUND",
                        &format!(
                            "Agent issued a new session id ({} replaced {})",
                            external_id, expected
                        ),
                    )
                    .await?;
            }
            Some(_) => {}
            None => {
                self.external_ids
                    .insert(session_id.to_string(), external_id.to_string());
                self.store
                    .set_runner_session_id(session_id, external_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Register a one-shot, surface the request, and answer the child once
    /// a human (or the timeout) decides.
    async fn handle_permission_request(
        &self,
        session_id: &str,
        stdin: Option<&Arc<Mutex<ChildStdin>>>,
        request: drover_runner_protocol::PermissionRequestEvent,
    ) {
        let request_id = request.request_id.unwrap_or_else(|| new_id("perm"));
        let tool_name = request.tool_name.unwrap_or_else(|| "unknown".to_string());
        let tool_input = request.tool_input.unwrap_or(Value::Null);

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

        let Some(stdin) = stdin.cloned() else {
            return;
        };
        let store = self.store.clone();
        let sink = self.sink.clone();
        let session_id = session_id.to_string();
        let permission_timeout = self.config.permission_timeout;
        tokio::spawn(async move {
            let decision = match timeout(permission_timeout, rx).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => {
                    // One-shot dropped without resolution: session teardown.
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
                    let deny = WorkerCommand::PermissionResponse(PermissionResponseCommand {
                        request_id,
                        behavior: "deny".to_string(),
                        updated_input: None,
                    });
                    let _ = Self::write_command(&stdin, &deny).await;
                    return;
                }
            };

            // The resolver already journalled permission_resolved; this task
            // only relays the decision to the child. A cancelled decision
            // means the child is being torn down.
            if decision.resolved_by == ResolvedBy::Cancelled {
                return;
            }
            let response = WorkerCommand::PermissionResponse(PermissionResponseCommand {
                request_id,
                behavior: if decision.allow { "allow" } else { "deny" }.to_string(),
                updated_input: decision.updated_input,
            });
            if let Err(err) = Self::write_command(&stdin, &response).await {
                warn!("Writing permission response for {} failed: {}", session_id, err);
            }
        });
    }
}

/// Serialize content blocks into (text, kind, is_final) output chunks.
///
/// A text block is final only when it is the last text block and no
/// tool_use block appears in the same emission. Tool results are clipped
/// and prefixed; thinking is forwarded as a step.
pub(crate) fn classify_blocks(blocks: &[ContentBlock]) -> Vec<(String, OutputKind, bool)> {
    let text_count = blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::Text { .. }))
        .count();
    let has_tool_use = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

    let mut out = Vec::new();
    let mut text_index = 0;
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                let is_final = !has_tool_use && text_index == text_count - 1;
                let kind = if is_final { OutputKind::Final } else { OutputKind::Step };
                out.push((text.clone(), kind, is_final));
                text_index += 1;
            }
            ContentBlock::ToolUse { name, .. } => {
                let name = name.as_deref().unwrap_or("unknown");
                out.push((format!("[tool: {}]\n", name), OutputKind::Step, false));
            }
            ContentBlock::ToolResult { content, is_error } => {
                let prefix = if *is_error { "[error] " } else { "[result] " };
                let clipped: String = if content.chars().count() > TOOL_RESULT_PREVIEW {
                    let head: String = content.chars().take(TOOL_RESULT_PREVIEW).collect();
                    format!("{}...", head)
                } else {
                    content.clone()
                };
                out.push((format!("{}{}\n", prefix, clipped), OutputKind::Step, false));
            }
            ContentBlock::Thinking { thinking } => {
                if !thinking.is_empty() {
                    out.push((format!("[thinking] {}\n", thinking), OutputKind::Step, false));
                }
            }
        }
    }
    out
}

#[async_trait]
impl Runner for SubprocessRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Subprocess
    }

    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.modes.insert(session_id.to_string(), mode);
        self.store.clear_stop_requested(session_id);

        let resume = self.resume_hint(session_id);
        let resume = self.maybe_drop_busy_resume(session_id, resume).await;

        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;
        self.spawn_turn(session_id, prompt, mode, resume).await
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let lock = self.spawn_lock(session_id);
        let _guard = lock.lock().await;
        if self.turns.contains_key(session_id) {
            debug!("Turn in flight for {}; queueing input", session_id);
            self.store.add_pending_input(session_id, text);
            return Ok(());
        }

        self.store.clear_stop_requested(session_id);
        let mode = self
            .modes
            .get(session_id)
            .map(|m| *m)
            .or_else(|| self.store.get_session(session_id).map(|s| s.approval_mode))
            .unwrap_or_default();
        let resume = self.resume_hint(session_id);
        let resume = self.maybe_drop_busy_resume(session_id, resume).await;

        self.spawn_turn(session_id, text, mode, resume).await
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

        let turn = self.turns.get(session_id).map(|t| ActiveTurn {
            stdin: t.stdin.clone(),
            kill: t.kill.clone(),
            done: t.done.clone(),
        });
        if let Some(turn) = turn {
            let _ = Self::write_command(&turn.stdin, &WorkerCommand::Stop).await;
            let mut done = turn.done;
            if timeout(STOP_GRACE, done.wait_for(|finished| *finished))
                .await
                .is_err()
            {
                turn.kill.notify_one();
                let _ = timeout(Duration::from_secs(2), done.wait_for(|finished| *finished)).await;
            }
        }

        self.store.clear_pending_inputs(session_id);
        Ok(Some(0))
    }

    async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.modes.insert(session_id.to_string(), mode);
        info!("Updated permission mode for {} to {}", session_id, mode);
        Ok(())
    }
}
