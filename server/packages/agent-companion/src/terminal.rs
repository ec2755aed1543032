//! Interactive terminals on the host or inside a container.
//!
//! Terminals are independent of agent sessions. Each one is a shell under a
//! pseudo-terminal whose output is broadcast to any number of sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_companion_error::CompanionError;
use axum::extract::ws::Message;
use chrono::{SecondsFormat, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use utoipa::ToSchema;

use crate::process::{
    OutputChunk, ProcessError, ProcessHandle, ProcessSpec, ProcessState, Signal, TerminalSize,
};

static TERMINAL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Shell for host terminals.
    pub shell: String,
    pub container_runtime: String,
    /// Shell started inside containers.
    pub container_shell: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            container_runtime: "docker".to_string(),
            container_shell: "/bin/sh".to_string(),
        }
    }
}

/// `$SHELL`, falling back to bash.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

#[derive(Debug, Clone, Default)]
pub struct TerminalOptions {
    /// Run inside this container instead of on the host.
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub pid: Option<u32>,
    pub created_at: String,
}

/// Messages exchanged over a terminal socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TerminalMessage {
    /// Output from the terminal
    Data { data: String },
    /// Keystrokes for the terminal
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    /// The shell exited
    Exit { code: Option<i32> },
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal not found: {terminal_id}")]
    NotFound { terminal_id: String },
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<TerminalError> for CompanionError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::NotFound { terminal_id } => {
                CompanionError::TerminalNotFound { terminal_id }
            }
            TerminalError::MissingField { field } => CompanionError::missing_field(field),
            TerminalError::Process(ProcessError::Closed) => CompanionError::InvalidRequest {
                message: "terminal is not running".to_string(),
            },
            TerminalError::Process(err @ ProcessError::NotPty) => CompanionError::InvalidRequest {
                message: err.to_string(),
            },
            TerminalError::Process(err) => CompanionError::LaunchFailed {
                message: err.to_string(),
                client_error: false,
            },
        }
    }
}

#[derive(Debug)]
struct ManagedTerminal {
    seq: u64,
    info: Mutex<TerminalInfo>,
    handle: Arc<ProcessHandle>,
    output: broadcast::Sender<Vec<u8>>,
}

type TerminalTable = RwLock<HashMap<String, Arc<ManagedTerminal>>>;

#[derive(Debug)]
pub struct TerminalManager {
    config: TerminalConfig,
    terminals: Arc<TerminalTable>,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            terminals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Starts a shell and returns its terminal id. Size defaults to 80x24.
    pub async fn spawn(
        &self,
        cwd: &str,
        cols: Option<u16>,
        rows: Option<u16>,
        options: TerminalOptions,
    ) -> Result<String, TerminalError> {
        if cwd.trim().is_empty() {
            return Err(TerminalError::MissingField { field: "cwd" });
        }
        let defaults = TerminalSize::default();
        let size = TerminalSize {
            cols: cols.filter(|c| *c > 0).unwrap_or(defaults.cols),
            rows: rows.filter(|r| *r > 0).unwrap_or(defaults.rows),
        };
        let container_id = options
            .container_id
            .filter(|id| !id.trim().is_empty());
        let spec = self.shell_spec(cwd, container_id.as_deref());

        let handle = Arc::new(ProcessHandle::spawn_pty(spec, size)?);
        let seq = TERMINAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = format!("term_{seq}");
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let terminal = Arc::new(ManagedTerminal {
            seq,
            info: Mutex::new(TerminalInfo {
                id: id.clone(),
                cwd: cwd.to_string(),
                cols: size.cols,
                rows: size.rows,
                container_id,
                pid: handle.pid(),
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
            handle: handle.clone(),
            output,
        });

        self.terminals
            .write()
            .await
            .insert(id.clone(), terminal.clone());
        tracing::info!(terminal_id = %id, pid = ?handle.pid(), cwd, "terminal spawned");

        tokio::spawn(monitor(self.terminals.clone(), id.clone(), terminal));
        Ok(id)
    }

    /// A terminal by id, or the most recently spawned one still running.
    pub async fn get_info(&self, terminal_id: Option<&str>) -> Option<TerminalInfo> {
        let terminal = match terminal_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .terminals
                .read()
                .await
                .get(id)
                .filter(|terminal| terminal.handle.is_alive())
                .cloned(),
            None => self
                .terminals
                .read()
                .await
                .values()
                .filter(|terminal| terminal.handle.is_alive())
                .max_by_key(|terminal| terminal.seq)
                .cloned(),
        }?;
        let info = terminal.info.lock().await.clone();
        Some(info)
    }

    /// Kills and forgets a terminal. Unknown ids are ignored.
    pub async fn kill(&self, terminal_id: &str) {
        let removed = self.terminals.write().await.remove(terminal_id);
        if let Some(terminal) = removed {
            terminal.handle.kill(Signal::Kill);
            tracing::info!(terminal_id, "terminal killed");
        }
    }

    pub async fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let terminal = self.lookup(terminal_id).await?;
        terminal.handle.resize(TerminalSize { cols, rows })?;
        let mut info = terminal.info.lock().await;
        info.cols = cols;
        info.rows = rows;
        Ok(())
    }

    pub async fn write(&self, terminal_id: &str, bytes: impl Into<Vec<u8>>) -> Result<(), TerminalError> {
        let terminal = self.lookup(terminal_id).await?;
        terminal.handle.write(bytes)?;
        Ok(())
    }

    /// Output from now on plus the exit state.
    pub async fn subscribe(
        &self,
        terminal_id: &str,
    ) -> Result<(broadcast::Receiver<Vec<u8>>, watch::Receiver<ProcessState>), TerminalError> {
        let terminal = self.lookup(terminal_id).await?;
        Ok((terminal.output.subscribe(), terminal.handle.subscribe_exit()))
    }

    async fn lookup(&self, terminal_id: &str) -> Result<Arc<ManagedTerminal>, TerminalError> {
        self.terminals
            .read()
            .await
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound {
                terminal_id: terminal_id.to_string(),
            })
    }

    fn shell_spec(&self, cwd: &str, container_id: Option<&str>) -> ProcessSpec {
        match container_id {
            Some(container_id) => ProcessSpec::new(self.config.container_runtime.clone()).args([
                "exec",
                "-it",
                "-w",
                cwd,
                container_id,
                self.config.container_shell.as_str(),
            ]),
            None => ProcessSpec::new(self.config.shell.clone()).cwd(cwd),
        }
    }
}

/// Forwards pty output to subscribers and drops the terminal once it exits.
async fn monitor(terminals: Arc<TerminalTable>, id: String, terminal: Arc<ManagedTerminal>) {
    let exited = terminal.handle.wait();
    tokio::pin!(exited);
    let code = match terminal.handle.take_output() {
        Some(mut output) => loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => forward(&terminal, chunk),
                    None => break (&mut exited).await,
                },
                code = &mut exited => {
                    // Background jobs can keep the pty open after the shell exits.
                    while let Ok(Some(chunk)) =
                        tokio::time::timeout(EXIT_DRAIN_GRACE, output.recv()).await
                    {
                        forward(&terminal, chunk);
                    }
                    break code;
                }
            }
        },
        None => (&mut exited).await,
    };

    let mut table = terminals.write().await;
    if table.get(&id).map(|t| t.seq == terminal.seq).unwrap_or(false) {
        table.remove(&id);
    }
    drop(table);
    tracing::info!(terminal_id = %id, ?code, "terminal exited");
}

fn forward(terminal: &ManagedTerminal, chunk: OutputChunk) {
    let (OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes)) = chunk;
    let _ = terminal.output.send(bytes);
}

/// Serves one terminal socket until the shell exits or the client leaves.
///
/// Text frames carry [`TerminalMessage`]s; binary frames are raw input.
pub async fn serve_terminal_socket<S, R, E>(
    manager: Arc<TerminalManager>,
    terminal_id: String,
    mut sink: S,
    mut stream: R,
) where
    S: Sink<Message> + Unpin + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: std::fmt::Display + Send,
{
    let (mut output, mut exit) = match manager.subscribe(&terminal_id).await {
        Ok(channels) => channels,
        Err(err) => {
            let _ = send_message(&mut sink, &TerminalMessage::Error {
                message: err.to_string(),
            })
            .await;
            let _ = sink.close().await;
            return;
        }
    };

    loop {
        let state = *exit.borrow();
        if let ProcessState::Exited { code } = state {
            // Flush whatever the shell printed last.
            while let Ok(bytes) = output.try_recv() {
                if send_output(&mut sink, bytes).await.is_err() {
                    break;
                }
            }
            let _ = send_message(&mut sink, &TerminalMessage::Exit { code }).await;
            break;
        }

        tokio::select! {
            received = output.recv() => match received {
                Ok(bytes) => {
                    if send_output(&mut sink, bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(terminal_id = %terminal_id, skipped, "terminal socket lagging");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if exit.changed().await.is_err() {
                        break;
                    }
                }
            },
            changed = exit.changed() => {
                if changed.is_err() && exit.borrow().is_running() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TerminalMessage>(&text) {
                        Ok(TerminalMessage::Input { data }) => {
                            if let Err(err) = manager.write(&terminal_id, data).await {
                                tracing::debug!(terminal_id = %terminal_id, error = %err, "terminal input dropped");
                            }
                        }
                        Ok(TerminalMessage::Resize { cols, rows }) => {
                            if let Err(err) = manager.resize(&terminal_id, cols, rows).await {
                                tracing::warn!(terminal_id = %terminal_id, error = %err, "failed to resize terminal");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::debug!(terminal_id = %terminal_id, error = %err, "ignoring malformed terminal message");
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(err) = manager.write(&terminal_id, data).await {
                        tracing::debug!(terminal_id = %terminal_id, error = %err, "terminal input dropped");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(terminal_id = %terminal_id, error = %err, "terminal socket read failed");
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
}

async fn send_output<S>(sink: &mut S, bytes: Vec<u8>) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    match String::from_utf8(bytes) {
        Ok(data) => send_message(sink, &TerminalMessage::Data { data }).await,
        Err(err) => sink
            .send(Message::Binary(err.into_bytes()))
            .await
            .map_err(|_| ()),
    }
}

async fn send_message<S>(sink: &mut S, message: &TerminalMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}
