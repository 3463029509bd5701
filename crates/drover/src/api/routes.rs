//! API route definitions.

use axum::{
    Router, middleware,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::auth_middleware;
use super::{external, handlers, sse};
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let protected_routes = Router::new()
        // Session lifecycle
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/sessions/attach", post(external::attach_session))
        .route(
            "/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{session_id}/start", post(handlers::start_session))
        .route("/sessions/{session_id}/input", post(handlers::send_input))
        .route(
            "/sessions/{session_id}/interrupt",
            post(handlers::interrupt_session),
        )
        .route(
            "/sessions/{session_id}/rename",
            patch(handlers::rename_session),
        )
        .route(
            "/sessions/{session_id}/approval-mode",
            patch(handlers::update_approval_mode),
        )
        .route(
            "/sessions/{session_id}/permission",
            post(handlers::respond_permission),
        )
        // External-agent integration
        .route(
            "/sessions/{session_id}/events",
            post(handlers::push_agent_event),
        )
        .route(
            "/sessions/{session_id}/events/poll",
            get(handlers::poll_agent_events),
        )
        .route("/sessions/{session_id}/usage", get(handlers::session_usage))
        .route("/sessions/{session_id}/sync", post(external::sync_session))
        // Event stream
        .route("/events/sessions/{session_id}", get(sse::session_events))
        // Discovery
        .route("/external-sessions", get(external::list_sessions))
        .route(
            "/external-sessions/{external_id}/history",
            get(external::session_history),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
