//! Application state shared across handlers.

use std::sync::Arc;

use crate::discovery::Scanner;
use crate::runner::RunnerRegistry;
use crate::session::models::RunnerKind;
use crate::store::SessionStore;

/// Shared state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub runners: Arc<RunnerRegistry>,
    pub scanner: Arc<Scanner>,
    /// Bearer token required on every request; None disables auth.
    pub auth_token: Option<String>,
    /// Adapter used when a create request does not name one.
    pub default_adapter: RunnerKind,
}

impl AppState {
    pub fn new(
        store: Arc<SessionStore>,
        runners: Arc<RunnerRegistry>,
        scanner: Arc<Scanner>,
        auth_token: Option<String>,
        default_adapter: RunnerKind,
    ) -> Self {
        Self {
            store,
            runners,
            scanner,
            auth_token,
            default_adapter,
        }
    }
}
