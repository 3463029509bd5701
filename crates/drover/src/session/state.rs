//! Session state machine.
//!
//! The single place that mutates `state`, `started_at` and `ended_at`.
//! Transitions are checked against a static table; anything unlisted is a
//! conflict.

use thiserror::Error;

use super::models::{Session, SessionState};
use crate::util::now_ts;

/// A transition that is not in the table.
#[derive(Debug, Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Legal (from, to) pairs. CREATED is only ever an initial state.
const VALID_TRANSITIONS: &[(SessionState, SessionState)] = &[
    (SessionState::Created, SessionState::Running),
    (SessionState::Running, SessionState::AwaitingInput),
    (SessionState::Running, SessionState::Interrupting),
    (SessionState::Running, SessionState::Error),
    (SessionState::AwaitingInput, SessionState::Running),
    (SessionState::AwaitingInput, SessionState::Error),
    (SessionState::Interrupting, SessionState::AwaitingInput),
    (SessionState::Interrupting, SessionState::Error),
    (SessionState::Error, SessionState::Running),
];

/// Side effects requested alongside a transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionOpts {
    /// Set `started_at` if it is not already set.
    pub started_at: bool,
    /// Set `ended_at` (terminal transitions).
    pub ended_at: bool,
    /// Record an exit code.
    pub exit_code: Option<i64>,
    /// Permit a no-op transition to the current state.
    pub allow_same: bool,
}

/// True if `(from, to)` is a listed transition.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    VALID_TRANSITIONS.contains(&(from, to))
}

/// Apply a state transition in place.
///
/// Always refreshes `last_activity_at`. With `allow_same`, transitioning to
/// the current state is a timestamp-only no-op (used by external event
/// pushes that assert the state they already observe).
pub fn transition(
    session: &mut Session,
    target: SessionState,
    opts: TransitionOpts,
) -> Result<(), StateError> {
    if session.state == target {
        if opts.allow_same {
            session.last_activity_at = Some(now_ts());
            return Ok(());
        }
        // RUNNING -> RUNNING is tolerated: a second input during an active
        // turn asserts the state without changing it.
        if target != SessionState::Running {
            return Err(StateError {
                from: session.state,
                to: target,
            });
        }
        session.last_activity_at = Some(now_ts());
        return Ok(());
    }

    if !is_valid_transition(session.state, target) {
        return Err(StateError {
            from: session.state,
            to: target,
        });
    }

    session.state = target;
    let now = now_ts();
    if opts.started_at && session.started_at.is_none() {
        session.started_at = Some(now.clone());
    }
    if opts.ended_at {
        session.ended_at = Some(now.clone());
    }
    if let Some(code) = opts.exit_code {
        session.exit_code = Some(code);
    }
    session.last_activity_at = Some(now);
    Ok(())
}

/// Derive a session name from the first prompt, unless the session was
/// already named. Whitespace is collapsed and the result capped at 80 chars.
pub fn maybe_set_session_name(session: &mut Session, prompt: &str) {
    if session.name != "New session" {
        return;
    }
    let cleaned: String = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return;
    }
    session.name = cleaned.chars().take(80).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::models::{ApprovalMode, RunnerKind};

    fn fresh_session() -> Session {
        Session {
            id: "sess_test".to_string(),
            state: SessionState::Created,
            directory: Some("/tmp/p".to_string()),
            adapter: RunnerKind::Subprocess,
            runner_session_id: None,
            approval_mode: ApprovalMode::Interactive,
            name: "New session".to_string(),
            summary: None,
            exit_code: None,
            runner_header: None,
            platform: None,
            platform_thread_id: None,
            created_at: now_ts(),
            started_at: None,
            ended_at: None,
            last_activity_at: None,
        }
    }

    #[test]
    fn test_created_to_running_sets_started_at() {
        let mut session = fresh_session();
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert!(session.started_at.is_some());
        assert!(session.last_activity_at.is_some());
    }

    #[test]
    fn test_full_turn_cycle() {
        let mut session = fresh_session();
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )
        .unwrap();
        transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        assert_eq!(session.state, SessionState::Running);
    }

    #[test]
    fn test_interrupt_cycle() {
        let mut session = fresh_session();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::Interrupting, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default()).unwrap();
        assert_eq!(session.state, SessionState::AwaitingInput);
    }

    #[test]
    fn test_error_is_recoverable() {
        let mut session = fresh_session();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        transition(
            &mut session,
            SessionState::Error,
            TransitionOpts {
                ended_at: true,
                exit_code: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(session.exit_code, Some(1));
        assert!(session.ended_at.is_some());

        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        assert_eq!(session.state, SessionState::Running);
    }

    #[test]
    fn test_created_to_awaiting_input_invalid() {
        let mut session = fresh_session();
        let err = transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default())
            .unwrap_err();
        assert_eq!(err.from, SessionState::Created);
        assert_eq!(session.state, SessionState::Created);
    }

    #[test]
    fn test_created_to_error_invalid() {
        let mut session = fresh_session();
        assert!(transition(&mut session, SessionState::Error, TransitionOpts::default()).is_err());
    }

    #[test]
    fn test_nothing_returns_to_created() {
        for from in [
            SessionState::Running,
            SessionState::AwaitingInput,
            SessionState::Interrupting,
            SessionState::Error,
        ] {
            assert!(!is_valid_transition(from, SessionState::Created));
        }
    }

    #[test]
    fn test_interrupting_to_running_invalid() {
        let mut session = fresh_session();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::Interrupting, TransitionOpts::default()).unwrap();
        assert!(transition(&mut session, SessionState::Running, TransitionOpts::default()).is_err());
    }

    #[test]
    fn test_allow_same_is_noop() {
        let mut session = fresh_session();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default()).unwrap();
        transition(
            &mut session,
            SessionState::AwaitingInput,
            TransitionOpts {
                allow_same: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(session.state, SessionState::AwaitingInput);
    }

    #[test]
    fn test_same_state_without_allow_same_conflicts() {
        let mut session = fresh_session();
        transition(&mut session, SessionState::Running, TransitionOpts::default()).unwrap();
        transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default()).unwrap();
        assert!(
            transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default())
                .is_err()
        );
    }

    #[test]
    fn test_started_at_not_overwritten() {
        let mut session = fresh_session();
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )
        .unwrap();
        let first = session.started_at.clone();
        transition(&mut session, SessionState::AwaitingInput, TransitionOpts::default()).unwrap();
        transition(
            &mut session,
            SessionState::Running,
            TransitionOpts {
                started_at: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(session.started_at, first);
    }

    #[test]
    fn test_maybe_set_session_name() {
        let mut session = fresh_session();
        maybe_set_session_name(&mut session, "Fix   the login\nbug");
        assert_eq!(session.name, "Fix the login bug");

        maybe_set_session_name(&mut session, "Another prompt");
        assert_eq!(session.name, "Fix the login bug");
    }

    #[test]
    fn test_maybe_set_session_name_caps_length() {
        let mut session = fresh_session();
        let long = "x".repeat(200);
        maybe_set_session_name(&mut session, &long);
        assert_eq!(session.name.chars().count(), 80);
    }

    #[test]
    fn test_maybe_set_session_name_ignores_blank() {
        let mut session = fresh_session();
        maybe_set_session_name(&mut session, "   ");
        assert_eq!(session.name, "New session");
    }
}
