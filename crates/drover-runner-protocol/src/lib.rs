//! Wire protocol for per-turn agent worker processes.
//!
//! The subprocess runner spawns one worker per turn and talks to it over
//! newline-delimited JSON: commands go to the worker's stdin, events come
//! back on its stdout. Stderr is diagnostic only and never parsed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent from drover to the worker on stdin.
///
/// A worker accepts exactly one `start` and then reacts to
/// `permission_response` and `stop` until it exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Begin a turn from a clean worker state.
    Start(StartCommand),

    /// Resolution for a previously emitted permission request.
    PermissionResponse(PermissionResponseCommand),

    /// Interrupt the active turn; the worker should exit promptly.
    Stop,
}

/// Event emitted by the worker on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Worker identity, emitted once before any output.
    Init(InitEvent),

    /// One emission of agent content blocks.
    Output(OutputEvent),

    /// The worker wants to run a tool and needs an answer.
    PermissionRequest(PermissionRequestEvent),

    /// End-of-turn accounting.
    Result(ResultEvent),

    /// Liveness signal while the turn is in flight.
    Heartbeat(HeartbeatEvent),

    /// A diagnostic line the worker chose to forward explicitly.
    Stderr(StderrEvent),

    /// Fatal worker-side failure.
    Error(ErrorEvent),
}

// ============================================================================
// Commands
// ============================================================================

/// Payload for the `start` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCommand {
    /// Prompt text for this turn.
    pub prompt: String,
    /// Working directory the agent operates in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Approval policy: "default", "acceptEdits" or "bypassPermissions".
    pub permission_mode: String,
    /// External session id to resume, if one is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

/// Payload for the `permission_response` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponseCommand {
    /// Id of the request being answered.
    pub request_id: String,
    /// "allow" or "deny".
    pub behavior: String,
    /// Replacement tool input, when the human edited it before allowing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

// ============================================================================
// Events
// ============================================================================

/// Payload for the `init` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitEvent {
    /// The worker's own session id (the external agent's identifier).
    #[serde(default)]
    pub session_id: Option<String>,
    /// Model the worker is driving.
    #[serde(default)]
    pub model: Option<String>,
    /// Agent CLI/SDK version string.
    #[serde(default)]
    pub version: Option<String>,
}

/// Payload for the `output` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Content blocks in emission order.
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
}

/// Payload for the `permission_request` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestEvent {
    /// Request id to echo back in the response.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Tool the agent wants to run.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Tool input as the agent proposed it.
    #[serde(default)]
    pub tool_input: Option<Value>,
}

/// Payload for the `result` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error_text: Option<String>,
}

/// Payload for the `heartbeat` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    /// Seconds since the turn started.
    #[serde(default)]
    pub elapsed_s: f64,
}

/// Payload for the `stderr` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StderrEvent {
    #[serde(default)]
    pub line: String,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Content blocks
// ============================================================================

/// A single content block inside an `output` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Assistant prose.
    Text {
        #[serde(default)]
        text: String,
    },

    /// Tool invocation. The input is deliberately not forwarded verbatim.
    ToolUse {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },

    /// Tool output fed back to the agent.
    ToolResult {
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Extended thinking.
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

/// Serialize a command as a single JSON line (including the trailing newline).
pub fn encode_command(cmd: &WorkerCommand) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(cmd)?;
    line.push('\n');
    Ok(line)
}

/// Parse one stdout line into a worker event.
pub fn decode_event(line: &str) -> serde_json::Result<WorkerEvent> {
    serde_json::from_str(line.trim())
}
