//! Claude Code session discovery and parsing.
//!
//! Sessions live at `~/.claude/projects/<encoded-path>/<uuid>.jsonl` where
//! the project directory path `/home/user/project` is encoded as
//! `-home-user-project`. Each line is a record with `type`, `message`,
//! `cwd` and `timestamp` fields.

use log::warn;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ExternalRunnerType, ExternalSessionDetail, ExternalSessionMessage, ExternalSessionSummary};
use crate::util::now_ts;

/// User-role content that is not an actual prompt.
const SKIP_PROMPT_PREFIXES: &[&str] = &[
    "[Request interrupted",
    "[Response interrupted",
    "[Tool result",
    "<system-",
];

pub(crate) fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Convert `/home/user/project` to `-home-user-project`.
pub fn encode_project_path(path: &str) -> String {
    format!("-{}", path.trim_start_matches('/').replace('/', "-"))
}

/// Convert `-home-user-project` back to `/home/user/project`.
pub fn decode_project_path(encoded: &str) -> String {
    format!("/{}", encoded.trim_start_matches('-').replace('-', "/"))
}

/// Extract the user's actual prompt text, skipping tool results, system
/// reminders and interrupted-request markers stored as user messages.
fn extract_user_prompt(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        let trimmed = text.trim_start();
        if SKIP_PROMPT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            return None;
        }
        let cleaned = text.trim();
        return (!cleaned.is_empty()).then(|| cleaned.to_string());
    }

    if let Some(blocks) = content.as_array() {
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                return None;
            }
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                let trimmed = text.trim_start();
                if SKIP_PROMPT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                    return None;
                }
                let cleaned = text.trim();
                if !cleaned.is_empty() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }
    None
}

/// Extract (text, thinking) from message content, skipping tool_use
/// arguments and raw tool_result bodies.
fn extract_text_content(content: &Value, role: &str) -> (String, Option<String>) {
    if let Some(text) = content.as_str() {
        return (text.to_string(), None);
    }

    let Some(blocks) = content.as_array() else {
        return (String::new(), None);
    };
    let mut texts = Vec::new();
    let mut thinking_parts = Vec::new();
    for block in blocks {
        let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match block_type {
            "tool_result" if role == "user" => continue,
            "tool_result" | "tool_use" => continue,
            "text" => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                }
            }
            "thinking" => {
                if let Some(thinking) = block.get("thinking").and_then(|t| t.as_str()) {
                    if !thinking.is_empty() {
                        thinking_parts.push(thinking.to_string());
                    }
                }
            }
            _ => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    texts.push(text.to_string());
                }
            }
        }
    }
    let thinking = (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n\n"));
    (texts.join("\n"), thinking)
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
    let session_id = session_file.file_stem()?.to_string_lossy().to_string();
    let contents = match fs::read_to_string(session_file) {
        Ok(contents) => contents,
        Err(err) => {
            warn!("Failed to read session file {:?}: {}", session_file, err);
            return None;
        }
    };

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
        if directory.is_none() {
            if let Some(cwd) = record.get("cwd").and_then(|c| c.as_str()) {
                directory = Some(cwd.to_string());
            }
        }

        match record.get("type").and_then(|t| t.as_str()) {
            Some("user") => {
                message_count += 1;
                let content = record
                    .pointer("/message/content")
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Some(text) = extract_user_prompt(&content) {
                    if first_prompt.is_none() {
                        first_prompt = Some(clip(&text));
                    }
                    last_prompt = Some(clip(&text));
                }
            }
            Some("assistant") => message_count += 1,
            _ => {}
        }
    }

    let directory = directory.unwrap_or_else(|| {
        decode_project_path(
            &session_file
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
    });
    let last_activity = last_activity.unwrap_or_else(|| file_mtime_ts(session_file));

    Some(ExternalSessionSummary {
        is_running: running.contains(&session_id),
        id: session_id,
        runner_type: ExternalRunnerType::ClaudeCode,
        directory,
        first_prompt,
        last_prompt,
        last_activity,
        message_count,
    })
}

/// Discover sessions under a specific projects root.
pub fn list_sessions_in(
    root: &Path,
    directory: Option<&str>,
    limit: usize,
    running: &HashSet<String>,
) -> Vec<ExternalSessionSummary> {
    if !root.exists() {
        return Vec::new();
    }

    let project_dirs: Vec<PathBuf> = match directory {
        Some(directory) => vec![root.join(encode_project_path(directory))],
        None => fs::read_dir(root)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut sessions = Vec::new();
    for project_dir in project_dirs {
        let Ok(entries) = fs::read_dir(&project_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            // Session files are UUID-named; skip anything else.
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if stem.len() < 32 || !stem.contains('-') {
                continue;
            }
            if let Some(summary) = parse_session_summary(&path, running) {
                sessions.push(summary);
            }
        }
    }

    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    sessions.truncate(limit);
    sessions
}

fn find_session_file(root: &Path, session_id: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let project_dir = entry.path();
        if !project_dir.is_dir() {
            continue;
        }
        let candidate = project_dir.join(format!("{}.jsonl", session_id));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Load full history for a session under a specific projects root.
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
        if directory.is_none() {
            if let Some(cwd) = record.get("cwd").and_then(|c| c.as_str()) {
                directory = Some(cwd.to_string());
            }
        }

        let content = record
            .pointer("/message/content")
            .cloned()
            .unwrap_or(Value::Null);
        match record.get("type").and_then(|t| t.as_str()) {
            Some("user") => {
                let (text, _) = extract_text_content(&content, "user");
                if !text.is_empty() {
                    if let Some(prompt) = extract_user_prompt(&content) {
                        if first_prompt.is_none() {
                            first_prompt = Some(clip(&prompt));
                        }
                        last_prompt = Some(clip(&prompt));
                    }
                    messages.push(ExternalSessionMessage {
                        role: "user".to_string(),
                        content: text,
                        thinking: None,
                        timestamp,
                    });
                }
            }
            Some("assistant") => {
                let (text, thinking) = extract_text_content(&content, "assistant");
                if !text.is_empty() || thinking.is_some() {
                    messages.push(ExternalSessionMessage {
                        role: "assistant".to_string(),
                        content: text,
                        thinking,
                        timestamp,
                    });
                }
            }
            _ => {}
        }
    }

    let directory = directory.unwrap_or_else(|| {
        decode_project_path(
            &session_file
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
    });
    let last_activity = last_activity.unwrap_or_else(|| file_mtime_ts(&session_file));

    if messages.len() > limit {
        messages = messages.split_off(messages.len() - limit);
    }

    Some(ExternalSessionDetail {
        id: session_id.to_string(),
        runner_type: ExternalRunnerType::ClaudeCode,
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

    const SESSION_ID: &str = "123e4567-e89b-42d3-a456-426614174000";

    fn write_fixture(root: &Path, project: &str, lines: &[Value]) -> PathBuf {
        let dir = root.join(project);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", SESSION_ID));
        let mut file = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn fixture_lines() -> Vec<Value> {
        vec![
            json!({
                "type": "user",
                "cwd": "/home/user/project",
                "timestamp": "2026-07-30T10:00:00Z",
                "message": {"role": "user", "content": "fix the bug"},
            }),
            json!({
                "type": "assistant",
                "timestamp": "2026-07-30T10:00:05Z",
                "message": {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "where is it"},
                    {"type": "text", "text": "found it"},
                    {"type": "tool_use", "name": "Edit", "input": {"file": "a.rs"}},
                ]},
            }),
            json!({
                "type": "user",
                "timestamp": "2026-07-30T10:00:10Z",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "content": "edited"},
                ]},
            }),
            json!({
                "type": "assistant",
                "timestamp": "2026-07-30T10:00:15Z",
                "message": {"role": "assistant", "content": [
                    {"type": "text", "text": "all done"},
                ]},
            }),
        ]
    }

    #[test]
    fn test_project_path_encoding() {
        assert_eq!(encode_project_path("/home/user/project"), "-home-user-project");
        assert_eq!(decode_project_path("-home-user-project"), "/home/user/project");
    }

    #[test]
    fn test_summary_counts_and_prompts() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "-home-user-project", &fixture_lines());

        let sessions = list_sessions_in(dir.path(), None, 50, &HashSet::new());
        assert_eq!(sessions.len(), 1);
        let summary = &sessions[0];
        assert_eq!(summary.id, SESSION_ID);
        assert_eq!(summary.directory, "/home/user/project");
        assert_eq!(summary.first_prompt.as_deref(), Some("fix the bug"));
        // The tool_result user record is counted but is not a prompt.
        assert_eq!(summary.message_count, 4);
        assert_eq!(summary.last_activity, "2026-07-30T10:00:15Z");
        assert!(!summary.is_running);
    }

    #[test]
    fn test_directory_filter_uses_encoding() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "-home-user-project", &fixture_lines());

        let hits = list_sessions_in(dir.path(), Some("/home/user/project"), 50, &HashSet::new());
        assert_eq!(hits.len(), 1);
        let misses = list_sessions_in(dir.path(), Some("/somewhere/else"), 50, &HashSet::new());
        assert!(misses.is_empty());
    }

    #[test]
    fn test_detail_skips_tool_results_and_splits_thinking() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "-home-user-project", &fixture_lines());

        let detail = get_session_detail_in(dir.path(), SESSION_ID, 100, &HashSet::new()).unwrap();
        // The tool_result-only user record is dropped entirely.
        assert_eq!(detail.messages.len(), 3);
        assert_eq!(detail.messages[0].role, "user");
        assert_eq!(detail.messages[0].content, "fix the bug");
        assert_eq!(detail.messages[1].role, "assistant");
        assert_eq!(detail.messages[1].content, "found it");
        assert_eq!(detail.messages[1].thinking.as_deref(), Some("where is it"));
        assert_eq!(detail.messages[2].content, "all done");
    }

    #[test]
    fn test_system_reminder_prompts_skipped() {
        let content = json!("<system-reminder>noise</system-reminder>");
        assert!(extract_user_prompt(&content).is_none());
        let content = json!("[Request interrupted by user]");
        assert!(extract_user_prompt(&content).is_none());
        let content = json!("  a real prompt  ");
        assert_eq!(extract_user_prompt(&content).as_deref(), Some("a real prompt"));
    }

    #[test]
    fn test_non_uuid_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-user-project");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("notes.jsonl"), "{}\n").unwrap();

        let sessions = list_sessions_in(dir.path(), None, 50, &HashSet::new());
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_detail_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_session_detail_in(dir.path(), SESSION_ID, 100, &HashSet::new()).is_none());
    }

    #[test]
    fn test_detail_message_limit_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "-home-user-project", &fixture_lines());

        let detail = get_session_detail_in(dir.path(), SESSION_ID, 1, &HashSet::new()).unwrap();
        assert_eq!(detail.messages.len(), 1);
        assert_eq!(detail.messages[0].content, "all done");
    }
}
