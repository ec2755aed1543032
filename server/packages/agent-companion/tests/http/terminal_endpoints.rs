// Terminal HTTP endpoint tests.
include!("../common/http.rs");

async fn spawn(app: &TestApp, body: Value) -> String {
    let (status, payload) = send_json(&app.app, Method::POST, "/v1/terminal/spawn", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "spawn terminal: {payload}");
    payload["terminalId"]
        .as_str()
        .expect("terminal id")
        .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_terminal_is_inactive() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/v1/terminal", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "active": false }));

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        "/v1/terminal?terminalId=term_unknown",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "active": false }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_requires_cwd() {
    let app = TestApp::new();
    for body in [json!({}), json!({ "cwd": "  " })] {
        let (status, payload) =
            send_json(&app.app, Method::POST, "/v1/terminal/spawn", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["field"], "cwd");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newest_terminal_is_active_until_killed() {
    let app = TestApp::new();
    let first = spawn(&app, json!({ "cwd": app.cwd() })).await;
    let second = spawn(&app, json!({ "cwd": app.cwd(), "cols": 120, "rows": 40 })).await;
    assert_ne!(first, second);

    let (_, payload) = send_json(&app.app, Method::GET, "/v1/terminal", None).await;
    assert_eq!(
        payload,
        json!({ "active": true, "terminalId": second, "cwd": app.cwd() })
    );

    let (_, payload) = send_json(
        &app.app,
        Method::GET,
        &format!("/v1/terminal?terminalId={first}"),
        None,
    )
    .await;
    assert_eq!(payload["terminalId"], first);

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/terminal/kill",
        Some(json!({ "terminalId": second })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "ok": true }));

    let (_, payload) = send_json(&app.app, Method::GET, "/v1/terminal", None).await;
    assert_eq!(payload["terminalId"], first);

    // Killing twice, or killing something unknown, is fine.
    for id in [second.as_str(), "term_unknown"] {
        let (status, _) = send_json(
            &app.app,
            Method::POST,
            "/v1/terminal/kill",
            Some(json!({ "terminalId": id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    send_json(
        &app.app,
        Method::POST,
        "/v1/terminal/kill",
        Some(json!({ "terminalId": first })),
    )
    .await;
    let (_, payload) = send_json(&app.app, Method::GET, "/v1/terminal", None).await;
    assert_eq!(payload, json!({ "active": false }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_requires_terminal_id() {
    let app = TestApp::new();
    let (status, payload) =
        send_json(&app.app, Method::POST, "/v1/terminal/kill", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["field"], "terminalId");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_terminal_spawns_through_runtime() {
    let app = TestApp::new();
    let id = spawn(
        &app,
        json!({ "cwd": "/workspace", "containerId": "abc123" }),
    )
    .await;
    assert!(id.starts_with("term_"));
}
