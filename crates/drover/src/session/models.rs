//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session exists but no runner has ever been started.
    Created,
    /// A runner owns the session and a turn is in flight.
    Running,
    /// The last turn finished; the session waits for operator input.
    AwaitingInput,
    /// An interrupt was requested; waiting for the runner to confirm.
    Interrupting,
    /// The runner failed. Recoverable: a new start or input re-enters RUNNING.
    Error,
}

impl SessionState {
    /// True while a runner owns the session.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Interrupting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::AwaitingInput => write!(f, "awaiting_input"),
            SessionState::Interrupting => write!(f, "interrupting"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SessionState::Created),
            "running" => Ok(SessionState::Running),
            "awaiting_input" => Ok(SessionState::AwaitingInput),
            "interrupting" => Ok(SessionState::Interrupting),
            "error" => Ok(SessionState::Error),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Approval policy for tool permission requests.
///
/// Wire-compatible with the integer `approval_choice` used by clients:
/// 0 = interactive, 1 = accept-edits, 2 = bypass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Every permission request is surfaced to a human.
    #[default]
    Interactive,
    /// File edits are approved automatically, everything else is surfaced.
    AcceptEdits,
    /// All permission requests are approved automatically.
    Bypass,
}

impl ApprovalMode {
    /// Map the client-facing integer choice onto a mode. Unknown values
    /// fall back to interactive.
    pub fn from_choice(choice: i64) -> Self {
        match choice {
            1 => ApprovalMode::AcceptEdits,
            2 => ApprovalMode::Bypass,
            _ => ApprovalMode::Interactive,
        }
    }

    /// The integer choice clients sent to select this mode.
    pub fn as_choice(self) -> i64 {
        match self {
            ApprovalMode::Interactive => 0,
            ApprovalMode::AcceptEdits => 1,
            ApprovalMode::Bypass => 2,
        }
    }

    /// The permission-mode string agent workers understand.
    pub fn worker_mode(self) -> &'static str {
        match self {
            ApprovalMode::Interactive => "default",
            ApprovalMode::AcceptEdits => "acceptEdits",
            ApprovalMode::Bypass => "bypassPermissions",
        }
    }
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalMode::Interactive => write!(f, "interactive"),
            ApprovalMode::AcceptEdits => write!(f, "accept-edits"),
            ApprovalMode::Bypass => write!(f, "bypass"),
        }
    }
}

impl std::str::FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interactive" => Ok(ApprovalMode::Interactive),
            "accept-edits" => Ok(ApprovalMode::AcceptEdits),
            "bypass" => Ok(ApprovalMode::Bypass),
            _ => Err(format!("unknown approval mode: {}", s)),
        }
    }
}

impl TryFrom<String> for ApprovalMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Which runner adapter drives a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// One worker subprocess per turn, JSON lines over stdin/stdout.
    #[default]
    Subprocess,
    /// Long-lived out-of-process sidecar over HTTP + SSE.
    Sidecar,
    /// In-process conversation loop against an LLM provider API.
    Api,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerKind::Subprocess => write!(f, "subprocess"),
            RunnerKind::Sidecar => write!(f, "sidecar"),
            RunnerKind::Api => write!(f, "api"),
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" => Ok(RunnerKind::Subprocess),
            "sidecar" => Ok(RunnerKind::Sidecar),
            "api" => Ok(RunnerKind::Api),
            _ => Err(format!("unknown adapter: {}", s)),
        }
    }
}

impl TryFrom<String> for RunnerKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A broker session.
///
/// Timestamps are ISO-8601 UTC strings, matching the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Unique session id (e.g. "sess_V1StGXR8Z5jd").
    pub id: String,
    /// Lifecycle state. Mutated only through the state machine.
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    /// Working directory presented to the runner.
    pub directory: Option<String>,
    /// Which runner adapter drives this session.
    #[sqlx(try_from = "String")]
    pub adapter: RunnerKind,
    /// The external agent's own session id, once bound.
    pub runner_session_id: Option<String>,
    /// Approval policy; persisted so it survives restart.
    #[sqlx(try_from = "String")]
    pub approval_mode: ApprovalMode,
    /// Human-readable name, derived from the first prompt unless renamed.
    pub name: String,
    /// One-line summary of the latest completed turn.
    pub summary: Option<String>,
    /// Exit code from the last runner exit, if any.
    pub exit_code: Option<i64>,
    /// Runner identity line (e.g. "Claude Code 2.1.0").
    pub runner_header: Option<String>,
    /// Optional chat-platform binding.
    pub platform: Option<String>,
    /// Thread id on the bound platform.
    pub platform_thread_id: Option<String>,
    /// When the session row was created.
    pub created_at: String,
    /// First transition into RUNNING; cleared on restart from a terminal state.
    pub started_at: Option<String>,
    /// Terminal transition timestamp; cleared on restart.
    pub ended_at: Option<String>,
    /// Refreshed on every transition and accepted input.
    pub last_activity_at: Option<String>,
}

/// Stored conversation message for the in-process API adapter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    /// "user" or "assistant".
    pub role: String,
    /// Content blocks, JSON-encoded.
    pub content: String,
    /// Per-session message order.
    pub seq: i64,
    pub created_at: String,
}
