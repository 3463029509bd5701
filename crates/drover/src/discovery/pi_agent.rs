//! Pi coding agent session discovery and parsing (view-only).
//!
//! Pi stores sessions under `~/.pi/agent/sessions/` in per-directory folders
//! encoded as `--home-user-project--`. Each session file is JSONL with a
//! `session` header record followed by tree-structured entries.

use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ExternalRunnerType, ExternalSessionDetail, ExternalSessionMessage, ExternalSessionSummary};
use crate::util::now_ts;

pub(crate) fn default_sessions_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PI_SESSIONS_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pi")
        .join("agent")
        .join("sessions")
}

/// Convert `--home-user-project--` to `/home/user/project`.
fn decode_directory_name(encoded: &str) -> String {
    format!("/{}", encoded.trim_matches('-').replace('-', "/"))
}

/// Convert `/home/user/project` to `--home-user-project--`.
fn encode_directory_name(path: &str) -> String {
    format!("--{}--", path.trim_start_matches('/').replace('/', "-"))
}

/// Extract text from a pi user message content (string or block list).
fn extract_user_text(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        let cleaned = text.trim();
        return (!cleaned.is_empty()).then(|| cleaned.to_string());
    }
    let blocks = content.as_array()?;
    let mut parts = Vec::new();
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
        }
    }
    let joined = parts.join("\n");
    let cleaned = joined.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Extract (text, thinking) from a pi assistant message content; toolCall
/// blocks are skipped.
fn extract_assistant_content(content: &Value) -> (String, Option<String>) {
    if let Some(text) = content.as_str() {
        return (text.to_string(), None);
    }
    let Some(blocks) = content.as_array() else {
        return (String::new(), None);
    };
    let mut texts = Vec::new();
    let mut thinking_parts = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                }
            }
            Some("thinking") => {
                if let Some(thinking) = block.get("thinking").and_then(|t| t.as_str()) {
                    if !thinking.is_empty() {
                        thinking_parts.push(thinking.to_string());
                    }
                }
            }
            _ => {}
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

/// Session id fallback from a `2026-02-11T07-36-34-614Z_<uuid>.jsonl` name.
fn session_id_from_stem(session_file: &Path) -> String {
    let stem = session_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match stem.split_once('_') {
        Some((_, id)) => id.to_string(),
        None => stem,
    }
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
        match record.get("type").and_then(|t| t.as_str()) {
            Some("session") => {
                if let Some(id) = record.get("id").and_then(|v| v.as_str()) {
                    session_id = Some(id.to_string());
                }
                if let Some(cwd) = record.get("cwd").and_then(|v| v.as_str()) {
                    directory = Some(cwd.to_string());
                }
            }
            Some("message") => {
                let message = record.get("message").cloned().unwrap_or(Value::Null);
                let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
                if matches!(role, "user" | "assistant") {
                    message_count += 1;
                }
                if role == "user" {
                    if let Some(text) =
                        extract_user_text(&message.get("content").cloned().unwrap_or(Value::Null))
                    {
                        if first_prompt.is_none() {
                            first_prompt = Some(clip(&text));
                        }
                        last_prompt = Some(clip(&text));
                    }
                }
            }
            _ => {}
        }
    }

    let directory = directory.unwrap_or_else(|| {
        decode_directory_name(
            &session_file
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
    });
    let session_id = session_id.unwrap_or_else(|| session_id_from_stem(session_file));
    let last_activity = last_activity.unwrap_or_else(|| file_mtime_ts(session_file));

    Some(ExternalSessionSummary {
        is_running: running.contains(&session_id),
        id: session_id,
        runner_type: ExternalRunnerType::PiAgent,
        directory,
        first_prompt,
        last_prompt,
        last_activity,
        message_count,
    })
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
    let project_dirs: Vec<PathBuf> = match directory {
        Some(directory) => vec![root.join(encode_directory_name(directory))],
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
        let Ok(files) = fs::read_dir(&project_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            if name.map(|n| n.contains(session_id)).unwrap_or(false) {
                return Some(path);
            }
        }
    }
    None
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
        match record.get("type").and_then(|t| t.as_str()) {
            Some("session") => {
                if let Some(cwd) = record.get("cwd").and_then(|v| v.as_str()) {
                    directory = Some(cwd.to_string());
                }
            }
            Some("message") => {
                let message = record.get("message").cloned().unwrap_or(Value::Null);
                let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
                let content = message.get("content").cloned().unwrap_or(Value::Null);
                match role {
                    "user" => {
                        if let Some(text) = extract_user_text(&content) {
                            if first_prompt.is_none() {
                                first_prompt = Some(clip(&text));
                            }
                            last_prompt = Some(clip(&text));
                            messages.push(ExternalSessionMessage {
                                role: "user".to_string(),
                                content: text,
                                thinking: None,
                                timestamp,
                            });
                        }
                    }
                    "assistant" => {
                        let (text, thinking) = extract_assistant_content(&content);
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
            _ => {}
        }
    }

    let directory = directory.unwrap_or_else(|| {
        decode_directory_name(
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
        runner_type: ExternalRunnerType::PiAgent,
        directory,
        first_prompt,
        last_prompt,
        last_activity,
        message_count: messages.len(),
        is_running: running.contains(session_id),
        messages,
    })
}
