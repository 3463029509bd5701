//! Runner adapters: one variant per agent backend.
//!
//! A runner binds a logical session to an external agent process and speaks
//! the uniform protocol below. Observable effects flow back through the
//! [`EventSink`], never as return values.

pub mod api;
pub mod sidecar;
pub mod sink;
pub mod subprocess;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::session::models::{ApprovalMode, RunnerKind};

pub use api::{ApiRunner, DenyAllTools, ToolDispatcher};
pub use sidecar::SidecarRunner;
pub use sink::EventSink;
pub use subprocess::SubprocessRunner;

/// Runner failure classification, mapped onto the HTTP surface by the
/// API layer.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The backend cannot be reached at all (503).
    #[error("agent backend unavailable: {0}")]
    Unavailable(String),

    /// Any other runner failure (500).
    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

/// Uniform protocol every backend variant implements.
///
/// All four operations are called with the per-session lock NOT held; they
/// may themselves emit through the sink, which acquires it.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Which adapter this is.
    fn kind(&self) -> RunnerKind;

    /// Begin a turn from a clean state.
    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError>;

    /// Deliver follow-up text; either starts a new turn or queues if one is
    /// in flight.
    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError>;

    /// Interrupt the active turn. The session survives from the runner's
    /// point of view.
    async fn stop(&self, session_id: &str) -> Result<Option<i64>, RunnerError>;

    /// Adjust the approval policy mid-session.
    async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError>;
}

/// Registry of constructed adapters, keyed by kind.
///
/// Built once at process init and threaded through the API state; tests
/// register mocks.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: DashMap<RunnerKind, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: DashMap::new(),
        }
    }

    pub fn register(&self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.kind(), runner);
    }

    /// Adapter for a kind, if one was configured.
    pub fn get(&self, kind: RunnerKind) -> Option<Arc<dyn Runner>> {
        self.runners.get(&kind).map(|r| r.clone())
    }
}
