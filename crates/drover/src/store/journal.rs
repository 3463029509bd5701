//! Durable per-session event journal.
//!
//! Append-only JSON lines at `<data-dir>/sessions/<id>/events.jsonl`.
//! When the file exceeds the configured size it is renamed to
//! `events.jsonl.1`, overwriting any prior rotated copy; exactly one rotated
//! generation is kept.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::events::{Event, EventData};

/// Default rotation threshold: 5 MB.
pub const DEFAULT_MAX_BYTES: u64 = 5_000_000;

/// Aggregated usage computed from `metadata` events.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}

/// Owns the journal directory tree for all sessions.
#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
    max_bytes: u64,
}

impl Journal {
    /// Create a journal rooted at `<data_dir>/sessions`.
    pub fn new(data_dir: &Path, max_bytes: u64) -> Result<Self> {
        let root = data_dir.join("sessions");
        fs::create_dir_all(&root)
            .with_context(|| format!("creating journal root at {:?}", root))?;
        Ok(Self { root, max_bytes })
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id).join("events.jsonl")
    }

    /// Append one event, rotating first if the file is over the threshold.
    pub fn append(&self, event: &Event) -> Result<()> {
        let path = self.log_path(&event.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating journal dir {:?}", parent))?;
        }

        if self.max_bytes > 0 {
            if let Ok(meta) = fs::metadata(&path) {
                if meta.len() > self.max_bytes {
                    let rotated = path.with_extension("jsonl.1");
                    if rotated.exists() {
                        let _ = fs::remove_file(&rotated);
                    }
                    if let Err(err) = fs::rename(&path, &rotated) {
                        warn!(
                            "Journal rotation failed for {}: {}",
                            event.session_id, err
                        );
                    } else {
                        info!(
                            "Rotated journal for {} at {} bytes (one generation kept)",
                            event.session_id,
                            meta.len()
                        );
                    }
                }
            }
        }

        let mut line = serde_json::to_string(event).context("serializing event")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal {:?}", path))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to journal {:?}", path))?;
        Ok(())
    }

    /// Read persisted events with `seq > since_seq`, current generation only.
    ///
    /// Blank and unparsable lines are skipped.
    pub fn read(
        &self,
        session_id: &str,
        since_seq: u64,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let path = self.log_path(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if event.seq <= since_seq {
                continue;
            }
            events.push(event);
            if let Some(limit) = limit {
                if events.len() >= limit {
                    break;
                }
            }
        }
        events
    }

    /// Highest seq present in the current journal generation (0 if none).
    ///
    /// Used on startup to seed the runtime counter so restarts never reuse
    /// sequence numbers.
    pub fn max_seq(&self, session_id: &str) -> u64 {
        self.read(session_id, 0, None)
            .last()
            .map(|event| event.seq)
            .unwrap_or(0)
    }

    /// Sum token and cost metadata over the journal.
    pub fn usage(&self, session_id: &str) -> Usage {
        let mut usage = Usage::default();
        for event in self.read(session_id, 0, None) {
            let EventData::Metadata { key, value, .. } = &event.data else {
                continue;
            };
            match key.as_str() {
                "tokens" => {
                    usage.input_tokens += value
                        .get("input")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    usage.output_tokens += value
                        .get("output")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
                "cost" => {
                    usage.total_cost_usd += value.as_f64().unwrap_or(0.0);
                }
                _ => {}
            }
        }
        usage
    }

    /// Remove a session's journal directory.
    pub fn remove(&self, session_id: &str) {
        let dir = self.root.join(session_id);
        let _ = fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputKind;
    use serde_json::json;

    fn event(session_id: &str, seq: u64, data: EventData) -> Event {
        Event {
            session_id: session_id.to_string(),
            ts: "2026-08-01T12:00:00Z".to_string(),
            seq,
            data,
        }
    }

    fn output_event(session_id: &str, seq: u64, text: &str) -> Event {
        event(
            session_id,
            seq,
            EventData::Output {
                stream: "combined".to_string(),
                text: text.to_string(),
                kind: OutputKind::Step,
                r#final: None,
                is_history: None,
            },
        )
    }

    #[test]
    fn test_append_and_read_since_seq() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), DEFAULT_MAX_BYTES).unwrap();

        for seq in 1..=5 {
            journal.append(&output_event("sess_a", seq, "hi")).unwrap();
        }

        let events = journal.read("sess_a", 2, None);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_read_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), DEFAULT_MAX_BYTES).unwrap();
        assert!(journal.read("sess_missing", 0, None).is_empty());
        assert_eq!(journal.max_seq("sess_missing"), 0);
    }

    #[test]
    fn test_max_seq_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), DEFAULT_MAX_BYTES).unwrap();
        for seq in 1..=42 {
            journal.append(&output_event("sess_b", seq, "x")).unwrap();
        }
        assert_eq!(journal.max_seq("sess_b"), 42);
    }

    #[test]
    fn test_rotation_keeps_single_generation_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold so a handful of events trigger rotation.
        let journal = Journal::new(dir.path(), 200).unwrap();

        for seq in 1..=50 {
            journal.append(&output_event("sess_c", seq, "some output text")).unwrap();
        }

        let rotated = dir.path().join("sessions/sess_c/events.jsonl.1");
        assert!(rotated.exists());
        assert!(!dir.path().join("sessions/sess_c/events.jsonl.2").exists());

        // New events are still served after rotation.
        journal.append(&output_event("sess_c", 51, "after rotation")).unwrap();
        let events = journal.read("sess_c", 0, None);
        assert_eq!(events.last().unwrap().seq, 51);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), DEFAULT_MAX_BYTES).unwrap();
        journal.append(&output_event("sess_d", 1, "ok")).unwrap();

        let path = dir.path().join("sessions/sess_d/events.jsonl");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("this is not json\n\n");
        fs::write(&path, contents).unwrap();
        journal.append(&output_event("sess_d", 2, "still ok")).unwrap();

        let events = journal.read("sess_d", 0, None);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_usage_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), DEFAULT_MAX_BYTES).unwrap();

        journal
            .append(&event(
                "sess_e",
                1,
                EventData::Metadata {
                    key: "tokens".to_string(),
                    value: json!({"input": 100, "output": 50}),
                    raw: "input: 100, output: 50".to_string(),
                },
            ))
            .unwrap();
        journal
            .append(&event(
                "sess_e",
                2,
                EventData::Metadata {
                    key: "cost".to_string(),
                    value: json!(0.25),
                    raw: "$0.2500".to_string(),
                },
            ))
            .unwrap();
        journal
            .append(&event(
                "sess_e",
                3,
                EventData::Metadata {
                    key: "tokens".to_string(),
                    value: json!({"input": 10, "output": 5}),
                    raw: "input: 10, output: 5".to_string(),
                },
            ))
            .unwrap();

        let usage = journal.usage("sess_e");
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.output_tokens, 55);
        assert!((usage.total_cost_usd - 0.25).abs() < 1e-9);
    }
}
