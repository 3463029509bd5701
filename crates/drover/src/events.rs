//! Event model for the per-session pipeline.
//!
//! Everything observable is an event `{session_id, ts, seq, type, data}`.
//! Payloads are a tagged union; opaque JSON appears only at the HTTP push
//! boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Intermediate output: tool use, thinking, partial text.
    Step,
    /// The last text of a turn.
    Final,
    /// Runner banner/identity text.
    Header,
}

/// Event payload, tagged by `type` with the body under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventData {
    /// Emitted after every state transition.
    SessionState { state: String },

    /// Runner identity, once per start.
    Header {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },

    /// One chunk of agent output.
    Output {
        stream: String,
        text: String,
        kind: OutputKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        r#final: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_history: Option<bool>,
    },

    /// Concatenated final text of a completed turn.
    OutputFinal {
        stream: String,
        text: String,
        kind: OutputKind,
        r#final: bool,
    },

    /// Operator-provided text.
    UserInput {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_history: Option<bool>,
    },

    /// A runner asks whether it may run a tool.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestions: Option<Value>,
    },

    /// Outcome of a permission request.
    PermissionResolved {
        request_id: String,
        /// One of "user", "timeout", "cancelled", "auto".
        resolved_by: String,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Error {
        code: String,
        message: String,
    },

    Warning {
        code: String,
        message: String,
    },

    /// Free-form key/value used for aggregation (tokens, cost, ...).
    Metadata {
        key: String,
        value: Value,
        raw: String,
    },

    /// Liveness signal at ~5 s cadence while a runner is active.
    Heartbeat {
        elapsed_s: f64,
        done: bool,
    },
}

impl EventData {
    /// The wire name of this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventData::SessionState { .. } => "session_state",
            EventData::Header { .. } => "header",
            EventData::Output { .. } => "output",
            EventData::OutputFinal { .. } => "output_final",
            EventData::UserInput { .. } => "user_input",
            EventData::PermissionRequest { .. } => "permission_request",
            EventData::PermissionResolved { .. } => "permission_resolved",
            EventData::Error { .. } => "error",
            EventData::Warning { .. } => "warning",
            EventData::Metadata { .. } => "metadata",
            EventData::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A journalled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    /// ISO-8601 UTC.
    pub ts: String,
    pub seq: u64,
    #[serde(flatten)]
    pub data: EventData,
}
