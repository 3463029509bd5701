//! Session entity: models, state machine and persistence.

pub mod models;
pub mod repository;
pub mod state;

pub use models::{ApprovalMode, RunnerKind, Session, SessionState, StoredMessage};
pub use repository::SessionRepository;
pub use state::{StateError, TransitionOpts, is_valid_transition, maybe_set_session_name, transition};
