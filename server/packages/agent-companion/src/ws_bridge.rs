//! Bridges agent sessions to WebSocket clients.
//!
//! Every tracked session gets one pump task that owns the process output,
//! decodes it with the session's backend codec, updates session state and
//! broadcasts canonical frames. Sockets only subscribe to that broadcast, so a
//! session keeps its status and rate limits current with nobody attached, and
//! a slow socket never holds up the pump.

use std::sync::Arc;
use std::time::Duration;

use agent_companion_error::CompanionError;
use axum::extract::ws::Message;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::process::{OutputChunk, OutputStream, ProcessHandle};
use crate::protocol::{AgentEvent, ClientCommand, LineFramer, Record, ServerFrame};
use crate::rate_limits::{from_codex, RateLimitSnapshot};
use crate::registry::{SessionEntry, SessionRegistry, SessionState, SessionStatus};

/// How long output may keep arriving after the backend itself has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WsBridge {
    registry: Arc<SessionRegistry>,
}

impl WsBridge {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Writes the backend handshake and starts the session's output pump.
    pub async fn track(&self, entry: Arc<SessionEntry>) {
        let Some(output) = entry.handle.take_output() else {
            tracing::warn!(session_id = %entry.id, "session output already taken");
            return;
        };

        let handshake = entry.state.lock().await.codec.handshake();
        if let Err(err) = write_lines(&entry.handle, &handshake) {
            tracing::warn!(session_id = %entry.id, error = %err, "failed to write backend handshake");
        }

        tokio::spawn(pump(entry, output));
    }

    /// Streams a session to one socket until either side ends.
    ///
    /// The client first receives a `session` snapshot; an already exited
    /// session is followed by its `exited` frame and the socket is closed.
    pub async fn attach<S, R, E>(
        &self,
        session_id: &str,
        mut sink: S,
        mut stream: R,
    ) -> Result<(), CompanionError>
    where
        S: Sink<Message> + Unpin + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: std::fmt::Display + Send,
    {
        let entry = self.lookup(session_id).await?;
        let mut frames = entry.subscribe();
        let snapshot = entry.snapshot().await;
        let exited = snapshot.status == SessionStatus::Exited;
        let exit_code = snapshot.exit_code;

        tracing::info!(session_id, "socket attached");
        if send_frame(&mut sink, &ServerFrame::Session { session: snapshot })
            .await
            .is_err()
        {
            return Ok(());
        }
        if exited {
            let _ = send_frame(&mut sink, &ServerFrame::Exited { exit_code }).await;
            let _ = sink.close().await;
            return Ok(());
        }

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        let last = matches!(frame, ServerFrame::Exited { .. });
                        if send_frame(&mut sink, &frame).await.is_err() || last {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id, skipped, "socket lagging, frames skipped");
                    }
                    Err(RecvError::Closed) => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_client_text(session_id, &text).await {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(session_id, error = %err, "socket read failed");
                        break;
                    }
                },
            }
        }

        let _ = sink.close().await;
        tracing::info!(session_id, "socket detached");
        Ok(())
    }

    /// Last rate limits a Codex session reported, if any.
    pub async fn get_codex_rate_limits(&self, session_id: &str) -> Option<RateLimitSnapshot> {
        let entry = self.registry.entry(session_id).await?;
        let state = entry.state.lock().await;
        state.rate_limits.clone()
    }

    /// Sends a user turn to the backend. Works with no socket attached.
    pub async fn inject_user_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<(), CompanionError> {
        let entry = self.lookup(session_id).await?;
        if content.trim().is_empty() {
            return Err(CompanionError::missing_field("content"));
        }
        let mut state = live_state(&entry).await?;
        let lines = state.codec.encode_user_message(content);
        write_session(&entry, &lines)?;
        entry.publish(ServerFrame::UserMessage {
            content: content.to_string(),
        });
        drop(state);
        tracing::debug!(session_id, "user message injected");
        Ok(())
    }

    pub async fn set_model(&self, session_id: &str, model: &str) -> Result<(), CompanionError> {
        let entry = self.lookup(session_id).await?;
        if model.trim().is_empty() {
            return Err(CompanionError::missing_field("model"));
        }
        let mut state = live_state(&entry).await?;
        let lines = state.codec.encode_set_model(model);
        write_session(&entry, &lines)?;
        state.info.model = Some(model.to_string());
        entry.publish(ServerFrame::Model {
            model: model.to_string(),
        });
        Ok(())
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), CompanionError> {
        let entry = self.lookup(session_id).await?;
        let mut state = live_state(&entry).await?;
        let lines = state.codec.encode_interrupt();
        write_session(&entry, &lines)
    }

    pub async fn respond_permission(
        &self,
        session_id: &str,
        request_id: &str,
        allow: bool,
        message: Option<&str>,
    ) -> Result<(), CompanionError> {
        let entry = self.lookup(session_id).await?;
        if request_id.trim().is_empty() {
            return Err(CompanionError::missing_field("requestId"));
        }
        let mut state = live_state(&entry).await?;
        let line = state
            .codec
            .encode_permission_response(request_id, allow, message)
            .ok_or_else(|| CompanionError::PermissionRequestNotFound {
                request_id: request_id.to_string(),
            })?;
        write_session(&entry, &[line])
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<SessionEntry>, CompanionError> {
        self.registry
            .entry(session_id)
            .await
            .ok_or_else(|| CompanionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn handle_client_text(&self, session_id: &str, text: &str) -> Option<ServerFrame> {
        let command: ClientCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(err) => {
                return Some(ServerFrame::Error {
                    message: format!("invalid command: {err}"),
                })
            }
        };
        let result = match command {
            ClientCommand::Ping => return Some(ServerFrame::Pong),
            ClientCommand::UserMessage { content } => {
                self.inject_user_message(session_id, &content).await
            }
            ClientCommand::SetModel { model } => self.set_model(session_id, &model).await,
            ClientCommand::Interrupt => self.interrupt(session_id).await,
            ClientCommand::PermissionResponse {
                request_id,
                allow,
                message,
            } => {
                self.respond_permission(session_id, &request_id, allow, message.as_deref())
                    .await
            }
        };
        result.err().map(|err| ServerFrame::Error {
            message: err.to_string(),
        })
    }
}

async fn live_state(
    entry: &SessionEntry,
) -> Result<tokio::sync::MutexGuard<'_, SessionState>, CompanionError> {
    if !entry.is_alive() {
        return Err(CompanionError::SessionNotRunning {
            session_id: entry.id.clone(),
        });
    }
    Ok(entry.state.lock().await)
}

fn write_session(entry: &SessionEntry, lines: &[String]) -> Result<(), CompanionError> {
    write_lines(&entry.handle, lines).map_err(|_| CompanionError::SessionNotRunning {
        session_id: entry.id.clone(),
    })
}

fn write_lines(
    handle: &ProcessHandle,
    lines: &[String],
) -> Result<(), crate::process::ProcessError> {
    for line in lines {
        let mut bytes = line.clone().into_bytes();
        bytes.push(b'\n');
        handle.write(bytes)?;
    }
    Ok(())
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

async fn pump(entry: Arc<SessionEntry>, mut output: OutputStream) {
    let session_id = entry.id.clone();
    let mut framer = LineFramer::default();
    let exited = entry.handle.wait();
    tokio::pin!(exited);

    let exit_code = loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => apply_chunk(&entry, &mut framer, chunk).await,
                None => break (&mut exited).await,
            },
            exit_code = &mut exited => {
                // Descendants can hold the pipes open after the backend exits,
                // so only wait briefly for output still in flight.
                while let Ok(Some(chunk)) =
                    tokio::time::timeout(EXIT_DRAIN_GRACE, output.recv()).await
                {
                    apply_chunk(&entry, &mut framer, chunk).await;
                }
                break exit_code;
            }
        }
    };
    for record in framer.finish() {
        apply_record(&entry, record).await;
    }

    {
        let mut state = entry.state.lock().await;
        state.info.status = SessionStatus::Exited;
        state.info.exit_code = exit_code;
    }
    tracing::info!(session_id = %session_id, ?exit_code, "session exited");
    entry.publish(ServerFrame::Status {
        status: SessionStatus::Exited,
    });
    entry.publish(ServerFrame::Exited { exit_code });
}

async fn apply_chunk(entry: &SessionEntry, framer: &mut LineFramer, chunk: OutputChunk) {
    match chunk {
        OutputChunk::Stdout(bytes) => {
            for record in framer.push(&bytes) {
                apply_record(entry, record).await;
            }
        }
        OutputChunk::Stderr(bytes) => {
            tracing::debug!(
                session_id = %entry.id,
                stderr = %String::from_utf8_lossy(&bytes).trim_end(),
                "backend stderr"
            );
        }
    }
}

async fn apply_record(entry: &SessionEntry, record: Record) {
    let value = match record {
        Record::Json(value) => value,
        Record::Text(line) => {
            tracing::debug!(session_id = %entry.id, %line, "ignoring non-json backend output");
            return;
        }
    };

    let mut state = entry.state.lock().await;
    let decoded = state.codec.decode(&value);
    if let Err(err) = write_lines(&entry.handle, &decoded.replies) {
        tracing::warn!(session_id = %entry.id, error = %err, "failed to reply to backend");
    }
    for event in decoded.events {
        apply_event(entry, &mut state, event);
    }
}

fn apply_event(entry: &SessionEntry, state: &mut SessionState, event: AgentEvent) {
    match event {
        AgentEvent::Ready => {
            if state.info.status == SessionStatus::Starting {
                transition(entry, state, SessionStatus::Idle);
            }
        }
        AgentEvent::Status(next) => transition(entry, state, next),
        AgentEvent::Token { text } => entry.publish(ServerFrame::Token { text }),
        AgentEvent::Message { role, text } => entry.publish(ServerFrame::Message { role, text }),
        AgentEvent::ToolUse { id, name, input } => {
            entry.publish(ServerFrame::ToolUse { id, name, input })
        }
        AgentEvent::PermissionRequest {
            request_id,
            tool,
            input,
        } => entry.publish(ServerFrame::PermissionRequest {
            request_id,
            tool,
            input,
        }),
        AgentEvent::RateLimits(snapshot) => {
            let limits = from_codex(&snapshot);
            state.rate_limits = Some(snapshot);
            state.rate_limits_at = Some(Utc::now());
            entry.publish(ServerFrame::RateLimits { limits });
        }
        AgentEvent::Model { model } => {
            if state.info.model.as_deref() != Some(model.as_str()) {
                state.info.model = Some(model.clone());
                entry.publish(ServerFrame::Model { model });
            }
        }
        AgentEvent::Error { message } => {
            tracing::warn!(session_id = %entry.id, %message, "backend reported an error");
            entry.publish(ServerFrame::Error { message });
        }
    }
}

/// `exited` is terminal; everything else follows the backend.
fn transition(entry: &SessionEntry, state: &mut SessionState, next: SessionStatus) {
    let current = state.info.status;
    if current == SessionStatus::Exited || current == next {
        return;
    }
    tracing::debug!(session_id = %entry.id, from = ?current, to = ?next, "status changed");
    state.info.status = next;
    entry.publish(ServerFrame::Status { status: next });
}
