// Usage and rate-limit endpoint tests.
include!("../common/http.rs");

const CODEX_SCRIPT: &str = r#"printf '%s\n' '{"method":"account/rateLimits/updated","params":{"rateLimits":{"primary":{"usedPercent":0.42,"windowDurationMins":300,"resetsAt":1700000000},"secondary":null}}}'; exec cat > stdin.log"#;

fn all_null() -> Value {
    json!({ "five_hour": null, "seven_day": null, "extra_usage": null })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_usage_without_reports_is_all_null() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/v1/usage-limits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, all_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn codex_rate_limits_are_served_canonically() {
    let app = TestApp::with_backends(BackendCommand::new("claude"), fake_backend(CODEX_SCRIPT));
    create_session(&app, "codex", "codex-1").await;

    let expected = json!({
        "five_hour": { "utilization": 0.42, "resets_at": "2023-11-14T22:13:20.000Z" },
        "seven_day": null,
        "extra_usage": null
    });
    let limits = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let (status, payload) = send_json(
                &app.app,
                Method::GET,
                "/v1/sessions/codex-1/usage-limits",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            if !payload["five_hour"].is_null() {
                return payload;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("rate limits reported");
    assert_eq!(limits, expected);

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        "/v1/sessions/codex-1/rate-limits",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["rateLimits"]["primary"]["usedPercent"], 0.42);
    assert!(payload["rateLimits"]["secondary"].is_null());

    // Without an Anthropic token the global view falls back to Codex.
    let (status, payload) = send_json(&app.app, Method::GET, "/v1/usage-limits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, expected);

    let handshake =
        wait_for_file_containing(&app.workdir.path().join("stdin.log"), "initialize").await;
    assert!(!handshake.contains("jsonrpc"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn codex_session_without_reports_is_all_null() {
    let app = TestApp::with_backends(
        BackendCommand::new("claude"),
        fake_backend("exec cat > stdin.log"),
    );
    create_session(&app, "codex", "codex-quiet").await;
    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        "/v1/sessions/codex-quiet/usage-limits",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, all_null());

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        "/v1/sessions/codex-quiet/rate-limits",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "rateLimits": null }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn openapi_document_lists_routes() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let paths = payload["paths"].as_object().expect("paths");
    assert!(paths.contains_key("/v1/sessions/{session_id}/message"));
    assert!(paths.contains_key("/v1/terminal/spawn"));

    let (status, payload) = send_json(&app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "status": "ok" }));
}
