//! API integration tests.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{create_session, request, send, test_app, test_app_hanging};

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

/// Protected endpoints reject missing and wrong tokens.
#[tokio::test]
async fn test_auth_required() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, request(Method::GET, "/sessions", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_create_and_fetch_session() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        request(Method::GET, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "created");
    assert_eq!(body["adapter"], "subprocess");
    assert_eq!(body["name"], "New session");

    let (status, body) = send(&app, request(Method::GET, "/sessions", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_session_validation() {
    let app = test_app().await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/sessions",
            Some(json!({"directory": "/definitely/not/a/real/dir"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        request(Method::POST, "/sessions", Some(json!({"adapter": "docker"}))),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_get_missing_session_404() {
    let app = test_app().await;
    let (status, body) = send(&app, request(Method::GET, "/sessions/sess_missing", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

/// Happy path: start produces the full expected event sequence and leaves
/// the session awaiting input.
#[tokio::test]
async fn test_start_happy_path_event_order() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "hello", "approval_choice": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "awaiting_input");
    assert_eq!(body["name"], "hello");
    assert!(body["started_at"].is_string());

    let events = app.store.read_event_log(&session_id, 0, None);
    let types: Vec<&str> = events.iter().map(|e| e.data.type_name()).collect();
    assert_eq!(
        types,
        vec![
            "session_state",
            "user_input",
            "header",
            "output",
            "output_final",
            "session_state",
        ]
    );
    // Seq is gapless from 1.
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_start_without_directory_422() {
    let app = test_app().await;
    let (_, body) = send(&app, request(Method::POST, "/sessions", Some(json!({})))).await;
    let session_id = body["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "x", "approval_choice": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_start_conflicts_while_running() {
    let app = test_app_hanging().await;
    let session_id = create_session(&app).await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "go", "approval_choice": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "again", "approval_choice": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_delete_refused_while_active() {
    let app = test_app_hanging().await;
    let session_id = create_session(&app).await;

    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "go", "approval_choice": 0})),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        request(Method::DELETE, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE");

    // Interrupt, then deletion succeeds.
    send(
        &app,
        request(Method::POST, &format!("/sessions/{}/interrupt", session_id), None),
    )
    .await;
    let (status, _) = send(
        &app,
        request(Method::DELETE, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

/// Interrupt during a turn: INTERRUPTING is entered, the runner's stop is
/// called, and the session settles in AWAITING_INPUT. Subsequent input
/// re-enters RUNNING.
#[tokio::test]
async fn test_interrupt_cycle() {
    let app = test_app_hanging().await;
    let session_id = create_session(&app).await;

    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "go", "approval_choice": 0})),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        request(Method::POST, &format!("/sessions/{}/interrupt", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "awaiting_input");
    assert!(app.runner.calls.lock().unwrap().contains(&"stop".to_string()));

    // Both transitions were journalled.
    let events = app.store.read_event_log(&session_id, 0, None);
    let states: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.data {
            drover::events::EventData::SessionState { state } => Some(state.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec!["running", "interrupting", "awaiting_input"]);

    // Fresh input starts a new turn.
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/input", session_id),
            Some(json!({"text": "next"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");
}

/// Interrupt is idempotent once the session is idle.
#[tokio::test]
async fn test_interrupt_idempotent_when_awaiting() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "go", "approval_choice": 0})),
        ),
    )
    .await;

    for _ in 0..2 {
        let (status, body) = send(
            &app,
            request(Method::POST, &format!("/sessions/{}/interrupt", session_id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "awaiting_input");
    }
    // The runner was never asked to stop an idle session.
    assert!(!app.runner.calls.lock().unwrap().contains(&"stop".to_string()));
}

#[tokio::test]
async fn test_interrupt_invalid_in_created() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        request(Method::POST, &format!("/sessions/{}/interrupt", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_input_invalid_in_created() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/input", session_id),
            Some(json!({"text": "hello"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_rename_session() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/sessions/{}/rename", session_id),
            Some(json!({"name": "  my   task  "})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "my task");

    let (status, _) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/sessions/{}/rename", session_id),
            Some(json!({"name": "   "})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_approval_mode_update_reaches_runner() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/sessions/{}/approval-mode", session_id),
            Some(json!({"approval_choice": 2})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approval_mode"], "bypass");
    assert!(app
        .runner
        .calls
        .lock()
        .unwrap()
        .contains(&"mode:bypass".to_string()));
}

/// Permission round-trip: a pushed request is resolvable exactly once, and
/// the resolution is journalled with the denial reason.
#[tokio::test]
async fn test_permission_deny_with_reason() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/events", session_id),
            Some(json!({
                "type": "permission_request",
                "data": {
                    "request_id": "req_1",
                    "tool_name": "Bash",
                    "tool_input": {"command": "rm -rf /"},
                },
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/permission", session_id),
            Some(json!({"request_id": "req_1", "allow": false, "message": "nope"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // First-writer-wins: the second resolution is a 404.
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/permission", session_id),
            Some(json!({"request_id": "req_1", "allow": true})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let events = app.store.read_event_log(&session_id, 0, None);
    let resolved = events
        .iter()
        .find_map(|e| match &e.data {
            drover::events::EventData::PermissionResolved {
                request_id,
                resolved_by,
                allowed,
                message,
            } if request_id == "req_1" => Some((resolved_by.clone(), *allowed, message.clone())),
            _ => None,
        })
        .expect("permission_resolved journalled");
    assert_eq!(resolved.0, "user");
    assert!(!resolved.1);
    assert_eq!(resolved.2.as_deref(), Some("nope"));
}

/// External-agent push: first event auto-transitions CREATED -> RUNNING,
/// unknown types are rejected.
#[tokio::test]
async fn test_agent_event_push() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/events", session_id),
            Some(json!({"type": "output", "data": {"text": "working...", "kind": "step"}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &app,
        request(Method::GET, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(body["state"], "running");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/events", session_id),
            Some(json!({"type": "telemetry", "data": {}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    // status=done parks the session back in awaiting_input.
    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/events", session_id),
            Some(json!({"type": "status", "data": {"status": "done"}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(
        &app,
        request(Method::GET, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(body["state"], "awaiting_input");
}

/// Poll defaults to agent-relevant event types.
#[tokio::test]
async fn test_poll_agent_events_default_filter() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "hello", "approval_choice": 0})),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/sessions/{}/events/poll?since_seq=0", session_id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "user_input");
    assert_eq!(events[0]["data"]["text"], "hello");

    // Explicit filter sees everything else.
    let (_, body) = send(
        &app,
        request(
            Method::GET,
            &format!(
                "/sessions/{}/events/poll?since_seq=0&types=output,session_state",
                session_id
            ),
            None,
        ),
    )
    .await;
    let events = body["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["type"] == "output"));
    assert!(events.iter().any(|e| e["type"] == "session_state"));
}

/// Usage aggregates metadata events from the journal.
#[tokio::test]
async fn test_usage_aggregation() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    app.store
        .emit_metadata(
            &session_id,
            "tokens",
            json!({"input": 120, "output": 40}),
            "input: 120, output: 40",
        )
        .await
        .unwrap();
    app.store
        .emit_metadata(&session_id, "cost", json!(0.5), "$0.5000")
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        request(Method::GET, &format!("/sessions/{}/usage", session_id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["input_tokens"], 120);
    assert_eq!(body["output_tokens"], 40);
    assert!((body["total_cost_usd"].as_f64().unwrap() - 0.5).abs() < 1e-9);
}

/// ERROR is recoverable: input clears it and re-enters RUNNING.
#[tokio::test]
async fn test_error_recovery_via_input() {
    let app = test_app_hanging().await;
    let session_id = create_session(&app).await;

    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/start", session_id),
            Some(json!({"prompt": "go", "approval_choice": 0})),
        ),
    )
    .await;

    // Simulate a runner failure pushed by the agent.
    send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/events", session_id),
            Some(json!({"type": "error", "data": {"code": "AGENT_ERROR", "message": "boom"}})),
        ),
    )
    .await;
    let (_, body) = send(
        &app,
        request(Method::GET, &format!("/sessions/{}", session_id), None),
    )
    .await;
    assert_eq!(body["state"], "error");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/sessions/{}/input", session_id),
            Some(json!({"text": "try again"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");
    assert!(body["ended_at"].is_null());
    assert!(body["exit_code"].is_null());
}
