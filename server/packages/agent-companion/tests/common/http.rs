use std::path::Path;
use std::time::Duration;

use agent_companion::config::CompanionConfig;
use agent_companion::launcher::{BackendCommand, LauncherConfig};
use agent_companion::router::{build_router, AppState};
use agent_companion::terminal::TerminalConfig;
use agent_companion::usage::UsageConfig;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct TestApp {
    app: Router,
    workdir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        Self::with_backends(BackendCommand::new("claude"), BackendCommand::new("codex"))
    }

    fn with_backends(claude: BackendCommand, codex: BackendCommand) -> Self {
        Self::with_config(CompanionConfig {
            launcher: LauncherConfig {
                claude,
                codex,
                ..LauncherConfig::default()
            },
            terminal: TerminalConfig {
                shell: "/bin/sh".to_string(),
                container_runtime: "sleep".to_string(),
                container_shell: "/bin/sh".to_string(),
            },
            usage: UsageConfig::default(),
        })
    }

    fn with_config(config: CompanionConfig) -> Self {
        let workdir = tempfile::tempdir().expect("create temp workdir");
        Self {
            app: build_router(AppState::new(config)),
            workdir,
        }
    }

    fn cwd(&self) -> String {
        self.workdir.path().to_string_lossy().into_owned()
    }
}

/// A backend stand-in: `sh -c <script>`, with the real backend flags landing
/// in `$0`, `$1`, ...
fn fake_backend(script: &str) -> BackendCommand {
    BackendCommand::new("sh").with_prefix_args(["-c", script])
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

async fn create_session(app: &TestApp, backend: &str, session_id: &str) -> Value {
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "sessionId": session_id, "backend": backend, "cwd": app.cwd() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create session: {payload}");
    payload
}

async fn wait_for_status(app: &Router, session_id: &str, expected: &str) -> Value {
    let path = format!("/v1/sessions/{session_id}");
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let (status, payload) = send_json(app, Method::GET, &path, None).await;
            assert_eq!(status, StatusCode::OK, "get session");
            if payload.get("status").and_then(Value::as_str) == Some(expected) {
                return payload;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session {session_id} never reached {expected}"))
}

async fn wait_for_file_containing(path: &Path, needle: &str) -> String {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if contents.contains(needle) {
                    return contents;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never contained {needle}", path.display()))
}

fn detail(payload: &Value) -> &str {
    payload.get("detail").and_then(Value::as_str).unwrap_or_default()
}
