//! External session discovery.
//!
//! Passive scanners over the on-disk stores maintained by the agent CLIs.
//! Each backend gets a parser that produces uniform summary/detail records;
//! a best-effort process scan marks sessions that are currently open in
//! another CLI.

pub mod claude_code;
pub mod codex_cli;
pub mod pi_agent;
pub mod running;

use serde::{Deserialize, Serialize};

/// Which external agent wrote the session files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalRunnerType {
    ClaudeCode,
    CodexCli,
    PiAgent,
}

impl ExternalRunnerType {
    /// Only Claude Code sessions can be attached (resumed); the others are
    /// view-only.
    pub fn supports_attach(self) -> bool {
        matches!(self, ExternalRunnerType::ClaudeCode)
    }
}

impl std::fmt::Display for ExternalRunnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalRunnerType::ClaudeCode => write!(f, "claude_code"),
            ExternalRunnerType::CodexCli => write!(f, "codex_cli"),
            ExternalRunnerType::PiAgent => write!(f, "pi_agent"),
        }
    }
}

impl std::str::FromStr for ExternalRunnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" => Ok(ExternalRunnerType::ClaudeCode),
            "codex_cli" => Ok(ExternalRunnerType::CodexCli),
            "pi_agent" => Ok(ExternalRunnerType::PiAgent),
            _ => Err(format!("unknown runner_type: {}", s)),
        }
    }
}

/// Summary of one external session.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalSessionSummary {
    pub id: String,
    pub runner_type: ExternalRunnerType,
    pub directory: String,
    pub first_prompt: Option<String>,
    pub last_prompt: Option<String>,
    pub last_activity: String,
    pub message_count: usize,
    pub is_running: bool,
}

/// One parsed message from an external session's history.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalSessionMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub timestamp: Option<String>,
}

/// Full detail for one external session.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalSessionDetail {
    pub id: String,
    pub runner_type: ExternalRunnerType,
    pub directory: String,
    pub first_prompt: Option<String>,
    pub last_prompt: Option<String>,
    pub last_activity: String,
    pub message_count: usize,
    pub is_running: bool,
    pub messages: Vec<ExternalSessionMessage>,
}

/// Root-directory overrides for the on-disk stores; `None` means the
/// backend's default location.
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    pub claude_projects_dir: Option<std::path::PathBuf>,
    pub codex_sessions_dir: Option<std::path::PathBuf>,
    pub pi_sessions_dir: Option<std::path::PathBuf>,
}

/// Dispatches discovery requests to the per-backend parsers.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// List sessions for one backend, newest first.
    pub fn list(
        &self,
        runner_type: ExternalRunnerType,
        directory: Option<&str>,
        limit: usize,
    ) -> Vec<ExternalSessionSummary> {
        let running = running::find_running_external_sessions();
        match runner_type {
            ExternalRunnerType::ClaudeCode => claude_code::list_sessions_in(
                &self
                    .config
                    .claude_projects_dir
                    .clone()
                    .unwrap_or_else(claude_code::default_projects_dir),
                directory,
                limit,
                &running,
            ),
            ExternalRunnerType::CodexCli => codex_cli::list_sessions_in(
                &self
                    .config
                    .codex_sessions_dir
                    .clone()
                    .unwrap_or_else(codex_cli::default_sessions_dir),
                directory,
                limit,
                &running,
            ),
            ExternalRunnerType::PiAgent => pi_agent::list_sessions_in(
                &self
                    .config
                    .pi_sessions_dir
                    .clone()
                    .unwrap_or_else(pi_agent::default_sessions_dir),
                directory,
                limit,
                &running,
            ),
        }
    }

    /// Load full history for one external session.
    pub fn detail(
        &self,
        runner_type: ExternalRunnerType,
        session_id: &str,
        limit: usize,
    ) -> Option<ExternalSessionDetail> {
        let running = running::find_running_external_sessions();
        match runner_type {
            ExternalRunnerType::ClaudeCode => claude_code::get_session_detail_in(
                &self
                    .config
                    .claude_projects_dir
                    .clone()
                    .unwrap_or_else(claude_code::default_projects_dir),
                session_id,
                limit,
                &running,
            ),
            ExternalRunnerType::CodexCli => codex_cli::get_session_detail_in(
                &self
                    .config
                    .codex_sessions_dir
                    .clone()
                    .unwrap_or_else(codex_cli::default_sessions_dir),
                session_id,
                limit,
                &running,
            ),
            ExternalRunnerType::PiAgent => pi_agent::get_session_detail_in(
                &self
                    .config
                    .pi_sessions_dir
                    .clone()
                    .unwrap_or_else(pi_agent::default_sessions_dir),
                session_id,
                limit,
                &running,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_type_round_trip() {
        for rt in [
            ExternalRunnerType::ClaudeCode,
            ExternalRunnerType::CodexCli,
            ExternalRunnerType::PiAgent,
        ] {
            let parsed: ExternalRunnerType = rt.to_string().parse().unwrap();
            assert_eq!(parsed, rt);
        }
        assert!("gemini".parse::<ExternalRunnerType>().is_err());
    }

    #[test]
    fn test_only_claude_code_attaches() {
        assert!(ExternalRunnerType::ClaudeCode.supports_attach());
        assert!(!ExternalRunnerType::CodexCli.supports_attach());
        assert!(!ExternalRunnerType::PiAgent.supports_attach());
    }
}
