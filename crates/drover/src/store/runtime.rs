//! Per-session runtime state (never persisted).

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::events::Event;

/// Ring size for output de-duplication.
pub const RECENT_OUTPUT_WINDOW: usize = 10;

/// Capacity of each subscriber queue. Fan-out never blocks: a full queue
/// drops the live copy (the journal stays authoritative).
pub const SUBSCRIBER_BUFFER_SIZE: usize = 256;

/// Who settled a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    User,
    Timeout,
    Cancelled,
    Auto,
}

impl ResolvedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedBy::User => "user",
            ResolvedBy::Timeout => "timeout",
            ResolvedBy::Cancelled => "cancelled",
            ResolvedBy::Auto => "auto",
        }
    }
}

/// Resolution delivered to the runner awaiting a permission request.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    pub allow: bool,
    pub message: Option<String>,
    pub updated_input: Option<Value>,
    pub resolved_by: ResolvedBy,
}

impl PermissionDecision {
    pub fn denied(resolved_by: ResolvedBy, message: impl Into<String>) -> Self {
        Self {
            allow: false,
            message: Some(message.into()),
            updated_input: None,
            resolved_by,
        }
    }
}

/// A registered but unresolved permission request.
pub(crate) struct PendingPermission {
    pub tool_name: String,
    pub tool_input: Value,
    pub tx: oneshot::Sender<PermissionDecision>,
}

/// A live event subscriber handle. Dropping it closes the queue; the store
/// prunes the registration on the next emit.
pub struct Subscriber {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

pub(crate) struct SubscriberEntry {
    pub tx: mpsc::Sender<Event>,
    /// Heartbeats are noise for most consumers; only opted-in subscribers
    /// receive them live (they always land in the journal).
    pub include_heartbeats: bool,
}

/// Runtime bookkeeping for one session.
pub struct SessionRuntime {
    /// Event sequence counter; the next emit uses `seq + 1`.
    pub(crate) seq: AtomicU64,
    /// Serializes state transitions, runner dispatch and input acceptance.
    /// Never held across a call into a runner adapter.
    pub(crate) op_lock: Arc<Mutex<()>>,
    /// Serializes seq assignment + journal append + fan-out.
    pub(crate) emit_lock: Mutex<()>,
    pub(crate) subscribers: StdMutex<HashMap<u64, SubscriberEntry>>,
    pub(crate) next_subscriber_id: AtomicU64,
    /// Pid of the active child, bookkeeping only; the adapter owns the handle.
    pub(crate) proc_pid: StdMutex<Option<u32>>,
    pub(crate) pending_inputs: StdMutex<VecDeque<String>>,
    pub(crate) recent_output: StdMutex<VecDeque<String>>,
    pub(crate) output_buf: StdMutex<String>,
    pub(crate) pending_permissions: StdMutex<HashMap<String, PendingPermission>>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) synced_message_count: AtomicUsize,
    pub(crate) synced_turn_count: AtomicUsize,
}

impl SessionRuntime {
    pub(crate) fn new(initial_seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(initial_seq),
            op_lock: Arc::new(Mutex::new(())),
            emit_lock: Mutex::new(()),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            proc_pid: StdMutex::new(None),
            pending_inputs: StdMutex::new(VecDeque::new()),
            recent_output: StdMutex::new(VecDeque::with_capacity(RECENT_OUTPUT_WINDOW)),
            output_buf: StdMutex::new(String::new()),
            pending_permissions: StdMutex::new(HashMap::new()),
            stop_requested: AtomicBool::new(false),
            synced_message_count: AtomicUsize::new(0),
            synced_turn_count: AtomicUsize::new(0),
        }
    }
}
