// Session socket behavior, driven through in-memory sinks and streams.
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_companion::config::CompanionConfig;
use agent_companion::launcher::{BackendCommand, LaunchRequest, LauncherConfig};
use agent_companion::registry::BackendType;
use agent_companion::router::AppState;
use axum::extract::ws::Message;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    state: Arc<AppState>,
    workdir: TempDir,
}

impl Harness {
    fn new(claude: BackendCommand, codex: BackendCommand) -> Self {
        let config = CompanionConfig {
            launcher: LauncherConfig {
                claude,
                codex,
                ..LauncherConfig::default()
            },
            ..CompanionConfig::default()
        };
        Self {
            state: Arc::new(AppState::new(config)),
            workdir: tempfile::tempdir().expect("create temp workdir"),
        }
    }

    async fn launch(&self, backend: BackendType, session_id: &str) {
        self.state
            .launcher
            .launch(LaunchRequest {
                session_id: Some(session_id.to_string()),
                backend,
                cwd: self.workdir.path().to_string_lossy().into_owned(),
                model: None,
            })
            .await
            .expect("launch session");
    }

    fn connect(&self, session_id: &str) -> Client {
        let (server_tx, server_rx) = mpsc::unbounded::<Message>();
        let (client_tx, client_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let bridge = self.state.bridge.clone();
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = bridge.attach(&session_id, server_tx, client_rx).await {
                panic!("attach failed: {err}");
            }
        });
        Client {
            frames: server_rx,
            input: client_tx,
            task,
        }
    }
}

struct Client {
    frames: UnboundedReceiver<Message>,
    input: UnboundedSender<Result<Message, Infallible>>,
    task: JoinHandle<()>,
}

impl Client {
    fn send(&self, frame: Value) {
        self.input
            .unbounded_send(Ok(Message::Text(frame.to_string())))
            .expect("socket open");
    }

    async fn next_frame(&mut self) -> Option<Value> {
        let message = tokio::time::timeout(WAIT_TIMEOUT, self.frames.next())
            .await
            .expect("frame before timeout")?;
        match message {
            Message::Text(text) => Some(serde_json::from_str(&text).expect("json frame")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    async fn frame_of_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self
                .next_frame()
                .await
                .unwrap_or_else(|| panic!("socket closed before a {kind} frame"));
            if frame["type"] == kind {
                return frame;
            }
        }
    }
}

fn fake_backend(script: &str) -> BackendCommand {
    BackendCommand::new("sh").with_prefix_args(["-c", script])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sockets_on_one_session_see_the_same_frames() {
    let token = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}}"#;
    let script = format!("while read -r line; do printf '%s\\n' '{token}'; done");
    let harness = Harness::new(fake_backend(&script), BackendCommand::new("codex"));
    harness.launch(BackendType::Claude, "shared").await;

    let mut first = harness.connect("shared");
    let mut second = harness.connect("shared");
    let snapshot = first.frame_of_type("session").await;
    assert_eq!(snapshot["session"]["id"], "shared");
    second.frame_of_type("session").await;

    first.send(json!({ "type": "user_message", "content": "hello" }));

    for client in [&mut first, &mut second] {
        let echo = client.frame_of_type("user_message").await;
        assert_eq!(echo["content"], "hello");
        let token = client.frame_of_type("token").await;
        assert_eq!(token["text"], "hi");
    }

    first.task.abort();
    second.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_exit_ends_the_socket() {
    let harness = Harness::new(
        fake_backend("read -r init; read -r turn; exit 3"),
        BackendCommand::new("codex"),
    );
    harness.launch(BackendType::Claude, "short-lived").await;

    let mut client = harness.connect("short-lived");
    client.frame_of_type("session").await;
    client.send(json!({ "type": "user_message", "content": "bye" }));

    let mut frames = Vec::new();
    while let Some(frame) = client.next_frame().await {
        frames.push(frame);
    }
    let last = frames.last().expect("frames before close");
    assert_eq!(last["type"], "exited");
    assert_eq!(last["exitCode"], 3);
    assert!(frames
        .iter()
        .any(|frame| frame["type"] == "status" && frame["status"] == "exited"));

    // Attaching after exit replays the snapshot and the exit, then closes.
    let mut late = harness.connect("short-lived");
    let snapshot = late.frame_of_type("session").await;
    assert_eq!(snapshot["session"]["status"], "exited");
    let exited = late.frame_of_type("exited").await;
    assert_eq!(exited["exitCode"], 3);
    assert!(late.next_frame().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_is_reported_while_a_child_holds_the_pipes() {
    // The background sleep inherits stdout and stderr and outlives the backend.
    let harness = Harness::new(
        fake_backend("sleep 20 & read -r init; read -r turn; exit 0"),
        BackendCommand::new("codex"),
    );
    harness.launch(BackendType::Claude, "orphaning").await;

    let mut client = harness.connect("orphaning");
    client.frame_of_type("session").await;
    client.send(json!({ "type": "user_message", "content": "bye" }));

    let mut frames = Vec::new();
    while let Some(frame) = client.next_frame().await {
        frames.push(frame);
    }
    let last = frames.last().expect("frames before close");
    assert_eq!(last["type"], "exited");
    assert_eq!(last["exitCode"], 0);
    assert!(frames
        .iter()
        .any(|frame| frame["type"] == "status" && frame["status"] == "exited"));

    let info = harness.state.registry.get("orphaning").await.expect("session kept");
    assert_eq!(info.exit_code, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_gets_pong_and_bad_frames_get_errors() {
    let harness = Harness::new(
        fake_backend("exec cat > /dev/null"),
        BackendCommand::new("codex"),
    );
    harness.launch(BackendType::Claude, "pinger").await;

    let mut client = harness.connect("pinger");
    client.frame_of_type("session").await;
    client.send(json!({ "type": "ping" }));
    client.frame_of_type("pong").await;

    client.send(json!({ "type": "nonsense" }));
    let error = client.frame_of_type("error").await;
    assert!(!error["message"].as_str().unwrap_or_default().is_empty());

    client.send(json!({ "type": "user_message", "content": "  " }));
    client.frame_of_type("error").await;

    client.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn codex_rate_limits_stream_as_canonical_frames() {
    let script = r#"read -r init
printf '%s\n' '{"id":1,"result":{}}'
read -r initialized
read -r start
printf '%s\n' '{"id":2,"result":{"thread":{"id":"thread-1"},"model":"gpt-5"}}'
read -r turn
printf '%s\n' '{"method":"account/rateLimits/updated","params":{"rateLimits":{"primary":{"usedPercent":0.5,"windowDurationMins":300,"resetsAt":1700000000},"secondary":{"usedPercent":0.1,"windowDurationMins":10080}}}}'
exec cat > /dev/null"#;
    let harness = Harness::new(BackendCommand::new("claude"), fake_backend(script));
    harness.launch(BackendType::Codex, "codex-ws").await;

    let mut client = harness.connect("codex-ws");
    client.frame_of_type("session").await;
    // Sent before the thread exists; the turn is queued until it does.
    client.send(json!({ "type": "user_message", "content": "go" }));

    let frame = client.frame_of_type("rate_limits").await;
    assert_eq!(
        frame["limits"],
        json!({
            "five_hour": { "utilization": 0.5, "resets_at": "2023-11-14T22:13:20.000Z" },
            "seven_day": { "utilization": 0.1, "resets_at": null },
            "extra_usage": null
        })
    );

    let snapshot = harness
        .state
        .bridge
        .get_codex_rate_limits("codex-ws")
        .await
        .expect("rate limits cached");
    assert_eq!(snapshot.primary.map(|window| window.used_percent), Some(0.5));

    client.task.abort();
}
