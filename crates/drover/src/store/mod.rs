//! Session store: the single source of truth for session state and all
//! per-session runtime resources.
//!
//! The store owns the in-memory session cache (backed by the SQLite
//! repository), the durable event journal, subscriber fan-out, pending
//! inputs, the output de-duplication ring and pending permission one-shots.
//!
//! Locking protocol: every state transition, runner dispatch and input
//! acceptance runs under the per-session lock obtained from
//! [`SessionStore::lock_session`]. The lock must never be held across a call
//! into a runner adapter — adapters call back into the store and would
//! deadlock. The canonical shape is: validate + transition + emit under the
//! lock, dispatch to the runner unlocked, finalize under the lock.

pub mod journal;
pub mod runtime;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};

use crate::db::Database;
use crate::events::{Event, EventData, OutputKind};
use crate::session::models::{ApprovalMode, RunnerKind, Session, SessionState, StoredMessage};
use crate::util::{new_id, now_ts};

pub use journal::{Journal, Usage};
pub use runtime::{
    PermissionDecision, RECENT_OUTPUT_WINDOW, ResolvedBy, SessionRuntime, Subscriber,
};
use runtime::{PendingPermission, SUBSCRIBER_BUFFER_SIZE, SubscriberEntry};

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex"));

/// Session registry with SQLite persistence and per-session runtime state.
pub struct SessionStore {
    repo: crate::session::SessionRepository,
    journal: Journal,
    sessions: DashMap<String, Session>,
    runtimes: DashMap<String, Arc<SessionRuntime>>,
    /// Serializes runner_session_id uniqueness checks.
    binding_lock: StdMutex<()>,
}

impl SessionStore {
    /// Load all persisted sessions and seed each runtime's sequence counter
    /// from its journal so restarts never reuse sequence numbers.
    pub async fn new(db: &Database, data_dir: &Path, journal_max_bytes: u64) -> Result<Self> {
        let repo = crate::session::SessionRepository::new(db.pool().clone());
        let journal = Journal::new(data_dir, journal_max_bytes)?;
        let store = Self {
            repo,
            journal,
            sessions: DashMap::new(),
            runtimes: DashMap::new(),
            binding_lock: StdMutex::new(()),
        };

        let rows = store.repo.list().await.context("loading sessions")?;
        for session in rows {
            let seq = store.journal.max_seq(&session.id);
            store
                .runtimes
                .insert(session.id.clone(), Arc::new(SessionRuntime::new(seq)));
            store.sessions.insert(session.id.clone(), session);
        }
        info!("Loaded {} sessions", store.sessions.len());
        Ok(store)
    }

    fn runtime(&self, session_id: &str) -> Arc<SessionRuntime> {
        self.runtimes
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionRuntime::new(0)))
            .clone()
    }

    /// Acquire the per-session operation lock.
    pub async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let runtime = self.runtime(session_id);
        runtime.op_lock.clone().lock_owned().await
    }

    // ------------------------------------------------------------------
    // Session CRUD
    // ------------------------------------------------------------------

    /// Create and register a new session in CREATED state.
    pub async fn create_session(
        &self,
        directory: Option<String>,
        adapter: RunnerKind,
        platform: Option<String>,
        platform_thread_id: Option<String>,
    ) -> Result<Session> {
        let now = now_ts();
        let session = Session {
            id: new_id("sess"),
            state: SessionState::Created,
            directory,
            adapter,
            runner_session_id: None,
            approval_mode: ApprovalMode::Interactive,
            name: "New session".to_string(),
            summary: None,
            exit_code: None,
            runner_header: None,
            platform,
            platform_thread_id,
            created_at: now.clone(),
            started_at: None,
            ended_at: None,
            last_activity_at: Some(now),
        };
        self.repo.create(&session).await?;
        self.runtimes
            .insert(session.id.clone(), Arc::new(SessionRuntime::new(0)));
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Fetch a session snapshot by id.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// All sessions currently tracked, newest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Persist an updated session snapshot.
    ///
    /// `runner_session_id` is immutable through this call: any change is
    /// reverted with a warning. Use [`SessionStore::set_runner_session_id`]
    /// or [`SessionStore::replace_runner_session_id`] instead.
    pub async fn update_session(&self, mut session: Session) -> Result<()> {
        if let Some(current) = self.sessions.get(&session.id) {
            if session.runner_session_id != current.runner_session_id {
                warn!(
                    "Ignoring runner_session_id change via update_session for {} ({:?} -> {:?})",
                    session.id, current.runner_session_id, session.runner_session_id
                );
                session.runner_session_id = current.runner_session_id.clone();
            }
        }
        self.repo.update(&session).await?;
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Remove a session, cancel its pending permissions and drop its runtime.
    ///
    /// State checks (refusal while active) belong to the caller; the journal
    /// files are left on disk.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        if self.sessions.remove(session_id).is_none() {
            return Ok(false);
        }
        self.clear_pending_permissions(session_id);
        self.repo.delete(session_id).await?;
        self.runtimes.remove(session_id);
        Ok(true)
    }

    /// Delete terminal sessions whose last activity is older than the window.
    pub async fn prune_sessions(&self, retention_days: i64) -> Result<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
        let mut removed = 0;
        for session in self.list_sessions() {
            if session.state.is_active() {
                continue;
            }
            let ts = session
                .ended_at
                .as_deref()
                .or(session.last_activity_at.as_deref())
                .unwrap_or(session.created_at.as_str());
            let Ok(when) = chrono::DateTime::parse_from_rfc3339(ts) else {
                continue;
            };
            if when.with_timezone(&chrono::Utc) < cutoff && self.delete_session(&session.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // External identity binding
    // ------------------------------------------------------------------

    /// Bind an external session id. Succeeds only if the session has no
    /// binding yet and no other session owns `value`; otherwise a no-op
    /// with a warning.
    pub async fn set_runner_session_id(&self, session_id: &str, value: &str) -> Result<bool> {
        let updated = {
            let _guard = self.binding_lock.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(owner) = self.find_session_by_runner_session_id(value) {
                if owner != session_id {
                    warn!(
                        "Refusing to bind {} to {}: already owned by {}",
                        value, session_id, owner
                    );
                    return Ok(false);
                }
                return Ok(true);
            }
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return Ok(false);
            };
            if session.runner_session_id.is_some() {
                warn!(
                    "Refusing to rebind {} via set_runner_session_id (bound to {:?})",
                    session_id, session.runner_session_id
                );
                return Ok(false);
            }
            session.runner_session_id = Some(value.to_string());
            session.clone()
        };
        self.repo.update(&updated).await?;
        Ok(true)
    }

    /// Atomic expiry replacement: rebind from `old` to `new`. Succeeds only
    /// if the current binding equals `old` (or is unset) and `new` is not
    /// owned by another session.
    pub async fn replace_runner_session_id(
        &self,
        session_id: &str,
        old: &str,
        new: &str,
    ) -> Result<bool> {
        let updated = {
            let _guard = self.binding_lock.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(owner) = self.find_session_by_runner_session_id(new) {
                if owner != session_id {
                    warn!(
                        "Refusing expiry rebind of {} to {}: already owned by {}",
                        session_id, new, owner
                    );
                    return Ok(false);
                }
            }
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return Ok(false);
            };
            match session.runner_session_id.as_deref() {
                None => {}
                Some(current) if current == old => {}
                Some(current) => {
                    warn!(
                        "Refusing expiry rebind of {}: bound to {} not {}",
                        session_id, current, old
                    );
                    return Ok(false);
                }
            }
            session.runner_session_id = Some(new.to_string());
            session.clone()
        };
        self.repo.update(&updated).await?;
        Ok(true)
    }

    /// Maintenance operation: drop the external binding entirely.
    pub async fn clear_runner_session_id(&self, session_id: &str) -> Result<()> {
        let updated = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return Ok(());
            };
            session.runner_session_id = None;
            session.clone()
        };
        self.repo.update(&updated).await?;
        Ok(())
    }

    /// Fetch the external binding for a session.
    pub fn get_runner_session_id(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.runner_session_id.clone())
    }

    /// Find the session that owns an external session id.
    pub fn find_session_by_runner_session_id(&self, value: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|s| s.runner_session_id.as_deref() == Some(value))
            .map(|s| s.id.clone())
    }

    // ------------------------------------------------------------------
    // Event pipeline
    // ------------------------------------------------------------------

    /// Advance the sequence counter, journal the event, and fan it out to
    /// live subscribers. A slow or gone subscriber never blocks the emit.
    pub async fn emit(&self, session_id: &str, data: EventData) -> Result<Event> {
        let runtime = self.runtime(session_id);
        let _guard = runtime.emit_lock.lock().await;

        let seq = runtime.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            session_id: session_id.to_string(),
            ts: now_ts(),
            seq,
            data,
        };
        self.journal.append(&event)?;

        let is_heartbeat = matches!(event.data, EventData::Heartbeat { .. });
        let snapshot: Vec<(u64, mpsc::Sender<Event>, bool)> = {
            let subs = runtime.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .map(|(id, entry)| (*id, entry.tx.clone(), entry.include_heartbeats))
                .collect()
        };
        debug!(
            "Broadcasting {} seq={} to {} subscribers",
            event.data.type_name(),
            seq,
            snapshot.len()
        );

        let mut gone: Vec<u64> = Vec::new();
        for (id, tx, include_heartbeats) in snapshot {
            if is_heartbeat && !include_heartbeats {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} for {} is full; dropping live event seq={}",
                        id, session_id, seq
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut subs = runtime.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for id in gone {
                subs.remove(&id);
            }
        }

        Ok(event)
    }

    /// Register a live subscriber queue for a session.
    pub fn subscribe(&self, session_id: &str, include_heartbeats: bool) -> Subscriber {
        let runtime = self.runtime(session_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = runtime.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = runtime.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(
            id,
            SubscriberEntry {
                tx,
                include_heartbeats,
            },
        );
        debug!(
            "New subscriber {} for {} (total {})",
            id,
            session_id,
            subs.len()
        );
        Subscriber { id, rx }
    }

    /// Unregister a subscriber queue.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        if let Some(runtime) = self.runtimes.get(session_id) {
            let mut subs = runtime.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subs.remove(&subscriber_id);
        }
    }

    /// Read persisted events for a session.
    pub fn read_event_log(
        &self,
        session_id: &str,
        since_seq: u64,
        limit: Option<usize>,
    ) -> Vec<Event> {
        self.journal.read(session_id, since_seq, limit)
    }

    /// Aggregated token/cost usage from the journal.
    pub fn session_usage(&self, session_id: &str) -> Usage {
        self.journal.usage(session_id)
    }

    // ------------------------------------------------------------------
    // Emit helpers
    // ------------------------------------------------------------------

    /// Emit a session_state event reflecting the session's current state.
    pub async fn emit_state(&self, session: &Session) -> Result<()> {
        self.emit(
            &session.id,
            EventData::SessionState {
                state: session.state.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a header event describing the runner identity.
    pub async fn emit_header(
        &self,
        session_id: &str,
        title: &str,
        model: Option<String>,
        provider: Option<String>,
        thread_id: Option<String>,
    ) -> Result<()> {
        self.emit(
            session_id,
            EventData::Header {
                title: title.to_string(),
                model,
                provider,
                thread_id,
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a user_input event.
    pub async fn emit_user_input(&self, session_id: &str, text: &str) -> Result<()> {
        self.emit(
            session_id,
            EventData::UserInput {
                text: text.to_string(),
                is_history: None,
            },
        )
        .await?;
        Ok(())
    }

    /// Emit output if it is non-empty and not a recent duplicate. The text
    /// always contributes to the turn buffer; reaching a final chunk flushes
    /// the buffer as one output_final event.
    pub async fn emit_output(
        &self,
        session_id: &str,
        text: &str,
        kind: OutputKind,
        is_final: Option<bool>,
    ) -> Result<()> {
        self.append_output(session_id, text);
        if !self.should_emit_output(session_id, text) {
            return Ok(());
        }
        self.emit(
            session_id,
            EventData::Output {
                stream: "combined".to_string(),
                text: text.to_string(),
                kind,
                r#final: is_final,
                is_history: None,
            },
        )
        .await?;

        let final_flag = is_final.unwrap_or(kind == OutputKind::Final);
        if final_flag {
            let full_text = self.consume_output(session_id);
            let full_text = full_text.trim();
            if !full_text.is_empty() {
                self.emit(
                    session_id,
                    EventData::OutputFinal {
                        stream: "combined".to_string(),
                        text: full_text.to_string(),
                        kind: OutputKind::Final,
                        r#final: true,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Emit one replayed history message (attach/sync). History bypasses the
    /// dedup ring and the turn buffer and is flagged so bridges do not
    /// re-notify.
    pub async fn emit_history_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        thinking: Option<&str>,
        is_final: bool,
    ) -> Result<()> {
        if role == "user" {
            if content.is_empty() {
                return Ok(());
            }
            self.emit(
                session_id,
                EventData::UserInput {
                    text: content.to_string(),
                    is_history: Some(true),
                },
            )
            .await?;
            return Ok(());
        }

        if let Some(thinking) = thinking {
            if !thinking.is_empty() {
                self.emit(
                    session_id,
                    EventData::Output {
                        stream: "combined".to_string(),
                        text: format!("[thinking] {}\n", thinking),
                        kind: OutputKind::Step,
                        r#final: Some(false),
                        is_history: Some(true),
                    },
                )
                .await?;
            }
        }
        if !content.is_empty() {
            self.emit(
                session_id,
                EventData::Output {
                    stream: "combined".to_string(),
                    text: content.to_string(),
                    kind: if is_final { OutputKind::Final } else { OutputKind::Step },
                    r#final: Some(is_final),
                    is_history: Some(true),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Emit an error event.
    pub async fn emit_error(&self, session_id: &str, code: &str, message: &str) -> Result<()> {
        self.emit(
            session_id,
            EventData::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a warning event.
    pub async fn emit_warning(&self, session_id: &str, code: &str, message: &str) -> Result<()> {
        self.emit(
            session_id,
            EventData::Warning {
                code: code.to_string(),
                message: message.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a metadata event.
    pub async fn emit_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
        raw: &str,
    ) -> Result<()> {
        self.emit(
            session_id,
            EventData::Metadata {
                key: key.to_string(),
                value,
                raw: raw.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a heartbeat event.
    pub async fn emit_heartbeat(&self, session_id: &str, elapsed_s: f64, done: bool) -> Result<()> {
        self.emit(session_id, EventData::Heartbeat { elapsed_s, done })
            .await?;
        Ok(())
    }

    /// Emit a permission_request event.
    pub async fn emit_permission_request(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
        suggestions: Option<Value>,
    ) -> Result<()> {
        self.emit(
            session_id,
            EventData::PermissionRequest {
                request_id: request_id.to_string(),
                tool_name: tool_name.to_string(),
                tool_input,
                suggestions,
            },
        )
        .await?;
        Ok(())
    }

    /// Emit a permission_resolved event.
    pub async fn emit_permission_resolved(
        &self,
        session_id: &str,
        request_id: &str,
        resolved_by: ResolvedBy,
        allowed: bool,
        message: Option<String>,
    ) -> Result<()> {
        self.emit(
            session_id,
            EventData::PermissionResolved {
                request_id: request_id.to_string(),
                resolved_by: resolved_by.as_str().to_string(),
                allowed,
                message,
            },
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output de-duplication
    // ------------------------------------------------------------------

    fn normalize_output(text: &str) -> String {
        let stripped = ANSI_RE.replace_all(text, "");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// True if the output is non-empty and not in the recent ring; records
    /// it in the ring when emitting.
    pub fn should_emit_output(&self, session_id: &str, text: &str) -> bool {
        let normalized = Self::normalize_output(text);
        if normalized.is_empty() {
            return false;
        }
        let runtime = self.runtime(session_id);
        let mut recent = runtime
            .recent_output
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if recent.contains(&normalized) {
            return false;
        }
        if recent.len() >= RECENT_OUTPUT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(normalized);
        true
    }

    fn append_output(&self, session_id: &str, text: &str) {
        let runtime = self.runtime(session_id);
        let mut buf = runtime.output_buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(text);
    }

    fn consume_output(&self, session_id: &str) -> String {
        let runtime = self.runtime(session_id);
        let mut buf = runtime.output_buf.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }

    /// Forget the dedup ring (new turn, fresh eyes).
    pub fn clear_last_output(&self, session_id: &str) {
        let runtime = self.runtime(session_id);
        runtime
            .recent_output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ------------------------------------------------------------------
    // Pending inputs
    // ------------------------------------------------------------------

    /// Queue input to deliver at the next turn boundary.
    pub fn add_pending_input(&self, session_id: &str, text: &str) {
        let runtime = self.runtime(session_id);
        runtime
            .pending_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(text.to_string());
    }

    /// Pop the next queued input, if any.
    pub fn pop_next_pending_input(&self, session_id: &str) -> Option<String> {
        let runtime = self.runtime(session_id);
        runtime
            .pending_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// True if there is queued input.
    pub fn has_pending_inputs(&self, session_id: &str) -> bool {
        let runtime = self.runtime(session_id);
        !runtime
            .pending_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn clear_pending_inputs(&self, session_id: &str) {
        let runtime = self.runtime(session_id);
        runtime
            .pending_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ------------------------------------------------------------------
    // Stop latch and process bookkeeping
    // ------------------------------------------------------------------

    /// Latch "the next natural turn boundary is an exit, not an await".
    pub fn request_stop(&self, session_id: &str) {
        self.runtime(session_id)
            .stop_requested
            .store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self, session_id: &str) -> bool {
        self.runtime(session_id).stop_requested.load(Ordering::SeqCst)
    }

    pub fn clear_stop_requested(&self, session_id: &str) {
        self.runtime(session_id)
            .stop_requested
            .store(false, Ordering::SeqCst);
    }

    /// Record the pid of the child currently serving this session.
    pub fn set_process(&self, session_id: &str, pid: u32) {
        let runtime = self.runtime(session_id);
        *runtime.proc_pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid);
    }

    pub fn get_process(&self, session_id: &str) -> Option<u32> {
        let runtime = self.runtime(session_id);
        *runtime.proc_pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear_process(&self, session_id: &str) {
        let runtime = self.runtime(session_id);
        *runtime.proc_pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // ------------------------------------------------------------------
    // Pending permissions
    // ------------------------------------------------------------------

    /// Register a pending permission and return the receiver the runner
    /// awaits. If the request id is already pending the old one-shot is
    /// cancelled.
    pub fn add_pending_permission(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> oneshot::Receiver<PermissionDecision> {
        let runtime = self.runtime(session_id);
        let (tx, rx) = oneshot::channel();
        let mut pending = runtime
            .pending_permissions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.insert(
            request_id.to_string(),
            PendingPermission {
                tool_name: tool_name.to_string(),
                tool_input,
                tx,
            },
        );
        rx
    }

    /// Deliver a decision to the runner. First writer wins: returns false if
    /// the request is unknown or already resolved. A receiver that already
    /// gave up (timeout path) does not un-resolve the request.
    pub fn resolve_pending_permission(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> bool {
        let Some(runtime) = self.runtimes.get(session_id).map(|r| r.clone()) else {
            return false;
        };
        let entry = {
            let mut pending = runtime
                .pending_permissions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.remove(request_id)
        };
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(decision);
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding permission (session deletion or stop).
    /// Returns the cancelled request ids so the caller can emit
    /// permission_resolved events.
    pub fn clear_pending_permissions(&self, session_id: &str) -> Vec<String> {
        let Some(runtime) = self.runtimes.get(session_id).map(|r| r.clone()) else {
            return Vec::new();
        };
        let drained: Vec<(String, PendingPermission)> = {
            let mut pending = runtime
                .pending_permissions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        let mut cancelled = Vec::new();
        for (request_id, entry) in drained {
            let _ = entry.tx.send(PermissionDecision::denied(
                ResolvedBy::Cancelled,
                "Session was interrupted",
            ));
            cancelled.push(request_id);
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Attach/sync watermarks
    // ------------------------------------------------------------------

    pub fn set_synced_message_count(&self, session_id: &str, count: usize) {
        self.runtime(session_id)
            .synced_message_count
            .store(count, Ordering::SeqCst);
    }

    pub fn get_synced_message_count(&self, session_id: &str) -> usize {
        self.runtime(session_id)
            .synced_message_count
            .load(Ordering::SeqCst)
    }

    pub fn set_synced_turn_count(&self, session_id: &str, count: usize) {
        self.runtime(session_id)
            .synced_turn_count
            .store(count, Ordering::SeqCst);
    }

    pub fn get_synced_turn_count(&self, session_id: &str) -> usize {
        self.runtime(session_id)
            .synced_turn_count
            .load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Conversation history (in-process API adapter)
    // ------------------------------------------------------------------

    /// Append a message to the stored conversation.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: Value,
    ) -> Result<StoredMessage> {
        let mut message = StoredMessage {
            id: new_id("msg"),
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: serde_json::to_string(&content).context("encoding message content")?,
            seq: 0,
            created_at: now_ts(),
        };
        message.seq = self.repo.add_message(&message).await?;
        Ok(message)
    }

    /// Conversation history shaped for a messages API call.
    pub async fn conversation(&self, session_id: &str) -> Result<Vec<Value>> {
        let rows = self.repo.list_messages(session_id).await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let content: Value =
                serde_json::from_str(&row.content).unwrap_or(Value::Array(Vec::new()));
            messages.push(serde_json::json!({"role": row.role, "content": content}));
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::models::RunnerKind;

    async fn test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db, dir.path(), journal::DEFAULT_MAX_BYTES)
            .await
            .unwrap();
        (store, dir)
    }

    async fn new_session(store: &SessionStore) -> Session {
        store
            .create_session(Some("/tmp/p".to_string()), RunnerKind::Subprocess, None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_emit_assigns_monotonic_seq() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        for _ in 0..3 {
            store.emit_user_input(&session.id, "hi").await.unwrap();
        }
        let events = store.read_event_log(&session.id, 0, None);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_seq_recovers_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let session_id;
        {
            let store = SessionStore::new(&db, dir.path(), journal::DEFAULT_MAX_BYTES)
                .await
                .unwrap();
            let session = new_session(&store).await;
            session_id = session.id.clone();
            for _ in 0..42 {
                store.emit_user_input(&session_id, "x").await.unwrap();
            }
        }
        // Same database, same journal dir: a fresh store must continue at 43.
        let store = SessionStore::new(&db, dir.path(), journal::DEFAULT_MAX_BYTES)
            .await
            .unwrap();
        let event = store.emit_user_input(&session_id, "next").await;
        assert!(event.is_ok());
        let events = store.read_event_log(&session_id, 42, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 43);
    }

    #[tokio::test]
    async fn test_output_dedup_still_accumulates() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        store
            .emit_output(&session.id, "same line\n", OutputKind::Step, Some(false))
            .await
            .unwrap();
        store
            .emit_output(&session.id, "same line\n", OutputKind::Step, Some(false))
            .await
            .unwrap();
        store
            .emit_output(&session.id, "done\n", OutputKind::Final, Some(true))
            .await
            .unwrap();

        let events = store.read_event_log(&session.id, 0, None);
        let outputs: Vec<&Event> = events
            .iter()
            .filter(|e| matches!(e.data, EventData::Output { .. }))
            .collect();
        assert_eq!(outputs.len(), 2, "duplicate emitted only once");

        let final_event = events
            .iter()
            .find(|e| matches!(e.data, EventData::OutputFinal { .. }))
            .unwrap();
        match &final_event.data {
            EventData::OutputFinal { text, .. } => {
                // Both copies of the duplicate are in the concatenation.
                assert_eq!(text, "same line\nsame line\ndone");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_ansi_stripped_for_dedup() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        assert!(store.should_emit_output(&session.id, "\x1b[32mhello\x1b[0m world"));
        assert!(!store.should_emit_output(&session.id, "hello   world"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        let mut sub = store.subscribe(&session.id, false);
        store.emit_user_input(&session.id, "hello").await.unwrap();
        store.emit_heartbeat(&session.id, 1.0, false).await.unwrap();
        store.emit_user_input(&session.id, "world").await.unwrap();

        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        // Heartbeat was filtered but still consumed a seq slot.
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 3);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_emit() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        let sub = store.subscribe(&session.id, false);
        drop(sub);
        store.emit_user_input(&session.id, "still fine").await.unwrap();
        store.emit_user_input(&session.id, "and again").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_runner_session_id_rules() {
        let (store, _dir) = test_store().await;
        let first = new_session(&store).await;
        let second = new_session(&store).await;

        assert!(store.set_runner_session_id(&first.id, "ext-1").await.unwrap());
        // Re-binding the same session to a different id is refused.
        assert!(!store.set_runner_session_id(&first.id, "ext-2").await.unwrap());
        // Another session cannot steal the binding.
        assert!(!store.set_runner_session_id(&second.id, "ext-1").await.unwrap());
        assert_eq!(
            store.find_session_by_runner_session_id("ext-1"),
            Some(first.id.clone())
        );
    }

    #[tokio::test]
    async fn test_replace_runner_session_id_expiry() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;
        store.set_runner_session_id(&session.id, "v1").await.unwrap();

        // Wrong old value is refused.
        assert!(!store
            .replace_runner_session_id(&session.id, "v0", "v2")
            .await
            .unwrap());
        // Correct expiry replacement succeeds.
        assert!(store
            .replace_runner_session_id(&session.id, "v1", "v2")
            .await
            .unwrap());
        assert_eq!(
            store.get_runner_session_id(&session.id).as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_update_session_reverts_binding_change() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;
        store.set_runner_session_id(&session.id, "v1").await.unwrap();

        let mut snapshot = store.get_session(&session.id).unwrap();
        snapshot.runner_session_id = Some("sneaky".to_string());
        snapshot.name = "renamed".to_string();
        store.update_session(snapshot).await.unwrap();

        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.runner_session_id.as_deref(), Some("v1"));
        assert_eq!(loaded.name, "renamed");
    }

    #[tokio::test]
    async fn test_permission_first_writer_wins() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        let rx = store.add_pending_permission(
            &session.id,
            "req_1",
            "Bash",
            serde_json::json!({"command": "ls"}),
        );
        let decision = PermissionDecision {
            allow: true,
            message: None,
            updated_input: None,
            resolved_by: ResolvedBy::User,
        };
        assert!(store.resolve_pending_permission(&session.id, "req_1", decision.clone()));
        assert!(!store.resolve_pending_permission(&session.id, "req_1", decision));

        let received = rx.await.unwrap();
        assert!(received.allow);
    }

    #[tokio::test]
    async fn test_clear_pending_permissions_cancels() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        let rx_a = store.add_pending_permission(&session.id, "req_a", "Bash", Value::Null);
        let rx_b = store.add_pending_permission(&session.id, "req_b", "Edit", Value::Null);
        let mut cancelled = store.clear_pending_permissions(&session.id);
        cancelled.sort();
        assert_eq!(cancelled, vec!["req_a".to_string(), "req_b".to_string()]);

        assert_eq!(rx_a.await.unwrap().resolved_by, ResolvedBy::Cancelled);
        assert!(!rx_b.await.unwrap().allow);
    }

    #[tokio::test]
    async fn test_pending_inputs_fifo() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;

        store.add_pending_input(&session.id, "first");
        store.add_pending_input(&session.id, "second");
        assert!(store.has_pending_inputs(&session.id));
        assert_eq!(store.pop_next_pending_input(&session.id).as_deref(), Some("first"));
        assert_eq!(store.pop_next_pending_input(&session.id).as_deref(), Some("second"));
        assert!(store.pop_next_pending_input(&session.id).is_none());
    }

    #[tokio::test]
    async fn test_delete_session_drops_runtime() {
        let (store, _dir) = test_store().await;
        let session = new_session(&store).await;
        store.add_pending_permission(&session.id, "req_1", "Bash", Value::Null);

        assert!(store.delete_session(&session.id).await.unwrap());
        assert!(store.get_session(&session.id).is_none());
        assert!(!store.delete_session(&session.id).await.unwrap());
    }
}
