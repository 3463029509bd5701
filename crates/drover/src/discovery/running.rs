//! Best-effort detection of agent sessions open in another CLI process.
//!
//! Inspects `/proc/<pid>/cmdline` for agent CLI invocations that mention a
//! session id. Anything that fails (no /proc, unreadable entries, other
//! platforms) degrades to "not running" — this check must never block
//! session progress.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Command names that identify agent CLIs.
const AGENT_CLI_NAMES: &[&str] = &["claude", "codex", "pi"];

/// True if argv0 names a known agent CLI.
fn is_agent_cli(argv0: &str) -> bool {
    let base = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| argv0.to_string());
    AGENT_CLI_NAMES.contains(&base.as_str())
}

/// Session ids mentioned in one process's argv.
fn session_ids_from_argv(argv: &[String]) -> Vec<String> {
    let Some(first) = argv.first() else {
        return Vec::new();
    };
    if !is_agent_cli(first) {
        return Vec::new();
    }
    argv.iter()
        .skip(1)
        .filter(|arg| Uuid::parse_str(arg).is_ok())
        .cloned()
        .collect()
}

fn read_argv(cmdline_path: &Path) -> Option<Vec<String>> {
    let raw = fs::read(cmdline_path).ok()?;
    let argv: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect();
    if argv.is_empty() { None } else { Some(argv) }
}

/// All session ids currently open in agent CLI processes.
pub fn find_running_external_sessions() -> HashSet<String> {
    let mut found = HashSet::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return found;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some(argv) = read_argv(&entry.path().join("cmdline")) else {
            continue;
        };
        for id in session_ids_from_argv(&argv) {
            found.insert(id);
        }
    }
    found
}

/// True if the given external session id is open in another CLI process.
pub fn is_external_session_running(session_id: &str) -> bool {
    find_running_external_sessions().contains(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_agent_cli_detection() {
        assert!(is_agent_cli("claude"));
        assert!(is_agent_cli("/usr/local/bin/codex"));
        assert!(!is_agent_cli("vim"));
        assert!(!is_agent_cli("/usr/bin/claudette"));
    }

    #[test]
    fn test_session_ids_extracted_from_agent_argv() {
        let ids = session_ids_from_argv(&argv(&[
            "claude",
            "--resume",
            "123e4567-e89b-42d3-a456-426614174000",
        ]));
        assert_eq!(ids, vec!["123e4567-e89b-42d3-a456-426614174000".to_string()]);
    }

    #[test]
    fn test_non_agent_process_ignored() {
        let ids = session_ids_from_argv(&argv(&[
            "bash",
            "123e4567-e89b-42d3-a456-426614174000",
        ]));
        assert!(ids.is_empty());
    }

    #[test]
    fn test_non_uuid_args_ignored() {
        let ids = session_ids_from_argv(&argv(&["codex", "resume", "--yolo"]));
        assert!(ids.is_empty());
    }
}
