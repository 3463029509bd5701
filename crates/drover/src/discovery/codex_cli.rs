//! Codex CLI session discovery and parsing (view-only).
//!
//! Rollout files live under `$CODEX_HOME/sessions` (default `~/.codex/sessions`),
//! nested in date directories, named `rollout-<ts>-<uuid>.jsonl`. Records
//! carry a `type` plus a `payload`; `session_meta` holds the id and cwd,
//! `response_item` messages hold the conversation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{ExternalRunnerType, ExternalSessionDetail, ExternalSessionMessage, ExternalSessionSummary};
use crate::util::now_ts;

static ROLLOUT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rollout-.*-([0-9a-fA-F-]{32,})\.jsonl$").expect("static regex"));

pub(crate) fn default_sessions_dir() -> PathBuf {
    if let Ok(home) = std::env::var("CODEX_HOME") {
        return PathBuf::from(home).join("sessions");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codex")
        .join("sessions")
}

/// Concatenate the text parts of a response_item content list.
fn extract_text(content: &Value) -> String {
    let Some(items) = content.as_array() else {
        return String::new();
    };
    let mut parts = Vec::new();
    for item in items {
        let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if matches!(item_type, "input_text" | "output_text" | "text") {
            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                parts.push(text);
            }
        }
    }
    parts.concat().trim().to_string()
}

fn is_environment_context(text: &str) -> bool {
    text.trim_start().starts_with("<environment_context>")
}

fn infer_session_id(session_file: &Path) -> Option<String> {
    let name = session_file.file_name()?.to_string_lossy();
    ROLLOUT_ID_RE
        .captures(&name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn clip(text: &str) -> String {
    text.chars().take(200).collect()
}

fn file_mtime_ts(path: &Path) -> String {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
        .unwrap_or_else(now_ts)
}

fn parse_session_summary(
    session_file: &Path,
    running: &HashSet<String>,
) -> Option<ExternalSessionSummary> {
    let contents = fs::read_to_string(session_file).ok()?;

    let mut session_id: Option<String> = None;
    let mut first_prompt = None;
    let mut last_prompt = None;
    let mut last_activity: Option<String> = None;
    let mut directory: Option<String> = None;
    let mut message_count = 0;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => continue,
        };
        if let Some(ts) = record.get("timestamp").and_then(|t| t.as_str()) {
            last_activity = Some(ts.to_string());
        }

        let record_type = record.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let payload = record.get("payload").cloned().unwrap_or(Value::Null);

        if record_type == "session_meta" {
            if let Some(id) = payload.get("id").and_then(|v| v.as_str()) {
                session_id = Some(id.to_string());
            }
            if let Some(cwd) = payload.get("cwd").and_then(|v| v.as_str()) {
                directory = Some(cwd.to_string());
            }
        }

        if record_type == "response_item"
            && payload.get("type").and_then(|t| t.as_str()) == Some("message")
        {
            let role = payload.get("role").and_then(|r| r.as_str()).unwrap_or("");
            let text = extract_text(&payload.get("content").cloned().unwrap_or(Value::Null));
            if matches!(role, "user" | "assistant") {
                message_count += 1;
            }
            if role == "user" && !text.is_empty() && !is_environment_context(&text) {
                if first_prompt.is_none() {
                    first_prompt = Some(clip(&text));
                }
                last_prompt = Some(clip(&text));
            }
        }
    }

    let session_id = session_id.or_else(|| infer_session_id(session_file))?;
    // Without a cwd the record is useless for attach/browse purposes.
    let directory = directory?;
    let last_activity = last_activity.unwrap_or_else(|| file_mtime_ts(session_file));

    Some(ExternalSessionSummary {
        is_running: running.contains(&session_id),
        id: session_id,
        runner_type: ExternalRunnerType::CodexCli,
        directory,
        first_prompt,
        last_prompt,
        last_activity,
        message_count,
    })
}

fn rollout_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("rollout-") && name.ends_with(".jsonl")
                })
                .unwrap_or(false)
        })
        .collect()
}

/// Discover sessions under a specific root.
pub fn list_sessions_in(
    root: &Path,
    directory: Option<&str>,
    limit: usize,
    running: &HashSet<String>,
) -> Vec<ExternalSessionSummary> {
    if !root.exists() {
        return Vec::new();
    }
    let mut sessions = Vec::new();
    for session_file in rollout_files(root) {
        let Some(summary) = parse_session_summary(&session_file, running) else {
            continue;
        };
        if let Some(directory) = directory {
            if summary.directory.trim_end_matches('/') != directory.trim_end_matches('/') {
                continue;
            }
        }
        sessions.push(summary);
    }
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    sessions.truncate(limit);
    sessions
}

fn find_session_file(root: &Path, session_id: &str) -> Option<PathBuf> {
    let files = rollout_files(root);
    // Fast path: the id is embedded in the file name.
    if let Some(path) = files.iter().find(|path| {
        path.file_name()
            .map(|n| n.to_string_lossy().contains(session_id))
            .unwrap_or(false)
    }) {
        return Some(path.clone());
    }
    // Fallback: scan for a matching session_meta id.
    files.into_iter().find(|path| {
        let Ok(contents) = fs::read_to_string(path) else {
            return false;
        };
        contents.lines().any(|line| {
            if !line.contains("session_meta") {
                return false;
            }
            serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|record| {
                    record
                        .pointer("/payload/id")
                        .and_then(|v| v.as_str())
                        .map(|id| id == session_id)
                })
                .unwrap_or(false)
        })
    })
}

/// Load full history for a session under a specific root.
pub fn get_session_detail_in(
    root: &Path,
    session_id: &str,
    limit: usize,
    running: &HashSet<String>,
) -> Option<ExternalSessionDetail> {
    let session_file = find_session_file(root, session_id)?;
    let contents = fs::read_to_string(&session_file).ok()?;

    let mut first_prompt = None;
    let mut last_prompt = None;
    let mut last_activity: Option<String> = None;
    let mut directory: Option<String> = None;
    let mut messages: Vec<ExternalSessionMessage> = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => continue,
        };
        let timestamp = record
            .get("timestamp")
            .and_then(|t| t.as_str())
            .map(String::from);
        if let Some(ts) = &timestamp {
            last_activity = Some(ts.clone());
        }

        let record_type = record.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let payload = record.get("payload").cloned().unwrap_or(Value::Null);

        if record_type == "session_meta" {
            if let Some(cwd) = payload.get("cwd").and_then(|v| v.as_str()) {
                directory = Some(cwd.to_string());
            }
        }

        if record_type == "response_item"
            && payload.get("type").and_then(|t| t.as_str()) == Some("message")
        {
            let role = payload.get("role").and_then(|r| r.as_str()).unwrap_or("");
            if !matches!(role, "user" | "assistant") {
                continue;
            }
            let text = extract_text(&payload.get("content").cloned().unwrap_or(Value::Null));
            if role == "user" && !text.is_empty() && !is_environment_context(&text) {
                if first_prompt.is_none() {
                    first_prompt = Some(clip(&text));
                }
                last_prompt = Some(clip(&text));
            }
            messages.push(ExternalSessionMessage {
                role: role.to_string(),
                content: text,
                thinking: None,
                timestamp,
            });
        }
    }

    let directory = directory?;
    let last_activity = last_activity.unwrap_or_else(|| file_mtime_ts(&session_file));
    if messages.len() > limit {
        messages = messages.split_off(messages.len() - limit);
    }

    Some(ExternalSessionDetail {
        id: session_id.to_string(),
        runner_type: ExternalRunnerType::CodexCli,
        directory,
        first_prompt,
        last_prompt,
        last_activity,
        message_count: messages.len(),
        is_running: running.contains(session_id),
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const SESSION_ID: &str = "019876fa-0b2c-7ddd-8000-aaaaaaaaaaaa";

    fn write_fixture(root: &Path) -> PathBuf {
        let dir = root.join("2026/07/30");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("rollout-2026-07-30T10-00-00-{}.jsonl", SESSION_ID));
        let mut file = fs::File::create(&path).unwrap();
        let lines = vec![
            json!({
                "type": "session_meta",
                "timestamp": "2026-07-30T10:00:00Z",
                "payload": {"id": SESSION_ID, "cwd": "/home/user/project"},
            }),
            json!({
                "type": "response_item",
                "timestamp": "2026-07-30T10:00:01Z",
                "payload": {"type": "message", "role": "user", "content": [
                    {"type": "input_text", "text": "<environment_context>...</environment_context>"},
                ]},
            }),
            json!({
                "type": "response_item",
                "timestamp": "2026-07-30T10:00:02Z",
                "payload": {"type": "message", "role": "user", "content": [
                    {"type": "input_text", "text": "add a test"},
                ]},
            }),
            json!({
                "type": "response_item",
                "timestamp": "2026-07-30T10:00:09Z",
                "payload": {"type": "message", "role": "assistant", "content": [
                    {"type": "output_text", "text": "added"},
                ]},
            }),
        ];
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_summary_skips_environment_context_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());

        let sessions = list_sessions_in(dir.path(), None, 50, &HashSet::new());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, SESSION_ID);
        assert_eq!(sessions[0].first_prompt.as_deref(), Some("add a test"));
        assert_eq!(sessions[0].message_count, 3);
    }

    #[test]
    fn test_detail_by_filename_and_directory_filter() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());

        let detail = get_session_detail_in(dir.path(), SESSION_ID, 100, &HashSet::new()).unwrap();
        assert_eq!(detail.directory, "/home/user/project");
        assert_eq!(detail.messages.len(), 3);
        assert_eq!(detail.messages.last().unwrap().content, "added");

        let filtered =
            list_sessions_in(dir.path(), Some("/home/user/project"), 50, &HashSet::new());
        assert_eq!(filtered.len(), 1);
        let misses = list_sessions_in(dir.path(), Some("/other"), 50, &HashSet::new());
        assert!(misses.is_empty());
    }

    #[test]
    fn test_rollout_id_inference() {
        let path = Path::new("rollout-2026-07-30T10-00-00-019876fa-0b2c-7ddd-8000-aaaaaaaaaaaa.jsonl");
        assert_eq!(infer_session_id(path).as_deref(), Some(SESSION_ID));
        assert!(infer_session_id(Path::new("notes.jsonl")).is_none());
    }

    #[test]
    fn test_missing_cwd_drops_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("rollout-x-{}.jsonl", SESSION_ID));
        fs::write(
            &path,
            format!(
                "{}\n",
                json!({"type": "session_meta", "payload": {"id": SESSION_ID}})
            ),
        )
        .unwrap();

        assert!(list_sessions_in(dir.path(), None, 50, &HashSet::new()).is_empty());
    }
}
