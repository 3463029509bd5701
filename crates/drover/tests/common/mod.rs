//! Test utilities and common setup.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, header};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use drover::api::{self, AppState};
use drover::db::Database;
use drover::discovery::{Scanner, ScannerConfig};
use drover::events::OutputKind;
use drover::runner::{EventSink, Runner, RunnerError, RunnerRegistry};
use drover::session::models::{ApprovalMode, RunnerKind};
use drover::store::SessionStore;

pub const TEST_TOKEN: &str = "test-token";

/// Scripted runner stand-in. `completing` mocks a turn that produces a
/// header, one final output and then awaits input; otherwise the turn is
/// left open so tests can drive interrupts.
pub struct MockRunner {
    sink: EventSink,
    completing: bool,
    pub calls: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(sink: EventSink, completing: bool) -> Arc<Self> {
        Arc::new(Self {
            sink,
            completing,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Subprocess
    }

    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        _mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.record(format!("start:{}", prompt));
        if self.completing {
            self.sink
                .on_header(
                    session_id,
                    "Mock Agent 1.0",
                    Some("mock-model".to_string()),
                    Some("mock".to_string()),
                    None,
                )
                .await
                .map_err(RunnerError::Failed)?;
            self.sink
                .on_output(session_id, "hi", OutputKind::Final, Some(true))
                .await
                .map_err(RunnerError::Failed)?;
            self.sink
                .on_awaiting_input(session_id)
                .await
                .map_err(RunnerError::Failed)?;
        }
        Ok(())
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        self.record(format!("input:{}", text));
        if self.completing {
            self.sink
                .on_output(session_id, text, OutputKind::Final, Some(true))
                .await
                .map_err(RunnerError::Failed)?;
            self.sink
                .on_awaiting_input(session_id)
                .await
                .map_err(RunnerError::Failed)?;
        }
        Ok(())
    }

    async fn stop(&self, _session_id: &str) -> Result<Option<i64>, RunnerError> {
        self.record("stop");
        Ok(Some(0))
    }

    async fn update_permission_mode(
        &self,
        _session_id: &str,
        mode: ApprovalMode,
    ) -> Result<(), RunnerError> {
        self.record(format!("mode:{}", mode));
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<SessionStore>,
    pub runner: Arc<MockRunner>,
    pub workdir: TempDir,
    /// Fixture root for the claude_code scanner.
    pub external_root: TempDir,
    _data_dir: TempDir,
}

async fn build_app(completing: bool) -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let external_root = tempfile::tempdir().unwrap();
    let db = Database::in_memory().await.unwrap();
    let store = Arc::new(
        SessionStore::new(&db, data_dir.path(), 5_000_000)
            .await
            .unwrap(),
    );
    let sink = EventSink::new(store.clone());
    let runner = MockRunner::new(sink, completing);

    let registry = Arc::new(RunnerRegistry::new());
    registry.register(runner.clone());

    let scanner = Arc::new(Scanner::new(ScannerConfig {
        claude_projects_dir: Some(external_root.path().to_path_buf()),
        codex_sessions_dir: Some(external_root.path().join("codex")),
        pi_sessions_dir: Some(external_root.path().join("pi")),
    }));

    let state = AppState::new(
        store.clone(),
        registry,
        scanner,
        Some(TEST_TOKEN.to_string()),
        RunnerKind::Subprocess,
    );
    TestApp {
        router: api::create_router(state),
        store,
        runner,
        workdir,
        external_root,
        _data_dir: data_dir,
    }
}

/// App whose runner completes every turn immediately.
pub async fn test_app() -> TestApp {
    build_app(true).await
}

/// App whose runner leaves turns open (for interrupt/queueing tests).
pub async fn test_app_hanging() -> TestApp {
    build_app(false).await
}

/// Build an authenticated JSON request.
pub fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .uri(uri)
        .method(method)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(body) => builder
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// One-shot the router and parse the JSON body.
pub async fn send(app: &TestApp, req: Request<Body>) -> (axum::http::StatusCode, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Write a claude_code-style external session fixture into the scanner
/// root. Returns the directory the session claims as its cwd.
pub fn write_external_session(app: &TestApp, external_id: &str, records: &[Value]) -> String {
    let directory = app.workdir.path().to_string_lossy().to_string();
    let encoded = format!("-{}", directory.trim_start_matches('/').replace('/', "-"));
    let project_dir = app.external_root.path().join(encoded);
    std::fs::create_dir_all(&project_dir).unwrap();
    let path = project_dir.join(format!("{}.jsonl", external_id));
    let lines: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
    directory
}

/// Standard two-turn external history fixture.
pub fn external_history(directory: &str) -> Vec<Value> {
    use serde_json::json;
    vec![
        json!({
            "type": "user",
            "cwd": directory,
            "timestamp": "2026-07-30T10:00:00Z",
            "message": {"role": "user", "content": "fix the bug"},
        }),
        json!({
            "type": "assistant",
            "timestamp": "2026-07-30T10:00:05Z",
            "message": {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hunting"},
                {"type": "text", "text": "found it"},
            ]},
        }),
        json!({
            "type": "user",
            "timestamp": "2026-07-30T10:00:10Z",
            "message": {"role": "user", "content": "now add a test"},
        }),
        json!({
            "type": "assistant",
            "timestamp": "2026-07-30T10:00:15Z",
            "message": {"role": "assistant", "content": [
                {"type": "text", "text": "test added"},
            ]},
        }),
    ]
}

/// Create a session bound to the scratch workdir, returning its id.
pub async fn create_session(app: &TestApp) -> String {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/sessions",
            Some(serde_json::json!({
                "directory": app.workdir.path().to_string_lossy(),
            })),
        ),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}
