// Session HTTP endpoint tests.
include!("../common/http.rs");

const CLAUDE_SCRIPT: &str = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"native-1","model":"fake-model"}'; exec cat > stdin.log"#;

const CLAUDE_ASKS_PERMISSION: &str = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"native-1","model":"fake-model"}' '{"type":"control_request","request_id":"perm-1","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"path":"a.txt"}}}'; exec cat > stdin.log"#;

fn claude_app() -> TestApp {
    TestApp::with_backends(fake_backend(CLAUDE_SCRIPT), BackendCommand::new("codex"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_to_unknown_session_is_not_found() {
    let app = TestApp::new();
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/missing/message",
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(detail(&payload).contains("not found"), "{payload}");

    let (status, _) = send_json(&app.app, Method::GET, "/v1/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send_json(
        &app.app,
        Method::GET,
        "/v1/sessions/missing/usage-limits",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_reaches_backend_without_a_socket() {
    let app = claude_app();
    let created = create_session(&app, "claude", "claude-1").await;
    assert_eq!(created["backend"], "claude");
    assert_eq!(created["id"], "claude-1");

    let session = wait_for_status(&app.app, "claude-1", "idle").await;
    assert_eq!(session["model"], "fake-model");

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/claude-1/message",
        Some(json!({ "content": "hello there" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload, json!({ "ok": true, "sessionId": "claude-1" }));

    let log = app.workdir.path().join("stdin.log");
    let contents = wait_for_file_containing(&log, "hello there").await;
    let turn: Value = contents
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|line| line["type"] == "user")
        .expect("user turn written to stdin");
    assert_eq!(turn["message"]["content"], "hello there");
    assert_eq!(turn["session_id"], "native-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_content_is_rejected_before_liveness() {
    let app = claude_app();
    create_session(&app, "claude", "claude-1").await;

    for body in [json!({ "content": "   " }), json!({})] {
        let (status, payload) = send_json(
            &app.app,
            Method::POST,
            "/v1/sessions/claude-1/message",
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(detail(&payload).contains("content"), "{payload}");
        assert_eq!(payload["field"], "content");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exited_session_is_reported_as_not_running() {
    let app = TestApp::with_backends(fake_backend("exit 0"), BackendCommand::new("codex"));
    create_session(&app, "claude", "dead-1").await;
    let session = wait_for_status(&app.app, "dead-1", "exited").await;
    assert_eq!(session["exitCode"], 0);

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/dead-1/message",
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(detail(&payload).contains("not running"), "{payload}");

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/dead-1/message",
        Some(json!({ "content": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(detail(&payload).contains("content"), "{payload}");

    // A dead session's id can be reused.
    create_session(&app, "claude", "dead-1").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_session_id_conflicts() {
    let app = claude_app();
    create_session(&app, "claude", "claude-1").await;
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "sessionId": "claude-1", "backend": "claude", "cwd": app.cwd() })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{payload}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_session_validates_input() {
    let app = claude_app();
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "cwd": app.cwd() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["field"], "backend");

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "backend": "claude", "cwd": "relative/path" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{payload}");

    let (status, payload) = send_json(&app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sessions"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_model_and_delete_session() {
    let app = claude_app();
    create_session(&app, "claude", "claude-1").await;
    wait_for_status(&app.app, "claude-1", "idle").await;

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/claude-1/model",
        Some(json!({ "model": "claude-opus-4" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["model"], "claude-opus-4");
    wait_for_file_containing(&app.workdir.path().join("stdin.log"), "set_model").await;

    let (status, payload) = send_json(&app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["sessions"].as_array().map(Vec::len), Some(1));

    let (status, _) = send_json(&app.app, Method::DELETE, "/v1/sessions/claude-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&app.app, Method::GET, "/v1/sessions/claude-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send_json(&app.app, Method::DELETE, "/v1/sessions/claude-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_reply_needs_a_pending_request() {
    let app = TestApp::with_backends(
        fake_backend(CLAUDE_ASKS_PERMISSION),
        BackendCommand::new("codex"),
    );
    create_session(&app, "claude", "asker").await;
    wait_for_status(&app.app, "asker", "idle").await;

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/asker/permissions/never-asked/reply",
        Some(json!({ "allow": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(detail(&payload).contains("permission request"), "{payload}");

    // The request line follows init on stdout; poll until it is decoded.
    let reply = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let (status, payload) = send_json(
                &app.app,
                Method::POST,
                "/v1/sessions/asker/permissions/perm-1/reply",
                Some(json!({ "allow": true })),
            )
            .await;
            if status != StatusCode::NOT_FOUND {
                return (status, payload);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("permission request decoded");
    assert_eq!(reply.0, StatusCode::OK, "{}", reply.1);
    assert_eq!(reply.1, json!({ "ok": true, "sessionId": "asker" }));

    let log = wait_for_file_containing(&app.workdir.path().join("stdin.log"), "perm-1").await;
    let answer: Value = log
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|line| line["type"] == "control_response")
        .expect("control response written to stdin");
    assert_eq!(answer["response"]["response"]["behavior"], "allow");
    assert_eq!(answer["response"]["response"]["updatedInput"]["path"], "a.txt");

    let (status, _) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/asker/permissions/perm-1/reply",
        Some(json!({ "allow": false })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
