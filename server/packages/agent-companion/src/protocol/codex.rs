//! Codex `app-server` protocol.
//!
//! JSON-RPC over stdio without the `jsonrpc` member. The client opens with
//! `initialize`, acknowledges with `initialized`, then starts a thread; every
//! user turn is a `turn/start` against that thread. The server pushes
//! notifications and may issue approval requests of its own.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::{str_at, AgentEvent, Decoded};
use crate::rate_limits::RateLimitSnapshot;
use crate::registry::SessionStatus;

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRequest {
    Initialize,
    ThreadStart,
    TurnStart,
    TurnInterrupt,
}

#[derive(Debug)]
pub struct CodexCodec {
    cwd: String,
    model: Option<String>,
    /// Model change not yet sent with a turn.
    model_override: Option<String>,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    thread_id: Option<String>,
    turn_id: Option<String>,
    /// Turns submitted before the thread existed.
    queued: Vec<String>,
    /// Approval prompts keyed by the id we expose, holding the server's raw id.
    approvals: HashMap<String, Value>,
}

impl CodexCodec {
    pub fn new(cwd: &str, model: Option<&str>) -> Self {
        Self {
            cwd: cwd.to_string(),
            model: model.map(str::to_string),
            model_override: None,
            next_id: 1,
            pending: HashMap::new(),
            thread_id: None,
            turn_id: None,
            queued: Vec::new(),
            approvals: HashMap::new(),
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn handshake(&mut self) -> Vec<String> {
        vec![self.request(
            PendingRequest::Initialize,
            "initialize",
            json!({
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )]
    }

    pub fn decode(&mut self, record: &Value) -> Decoded {
        let method = record.get("method").and_then(Value::as_str);
        let id = record.get("id");
        match (method, id) {
            (Some(method), Some(id)) => self.server_request(method, id.clone(), record),
            (Some(method), None) => self.notification(method, record.get("params")),
            (None, Some(id)) => self.response(id, record),
            (None, None) => Decoded::default(),
        }
    }

    pub fn user_message(&mut self, text: &str) -> Vec<String> {
        if self.thread_id.is_none() {
            self.queued.push(text.to_string());
            return Vec::new();
        }
        vec![self.turn_start(text)]
    }

    /// Takes effect on the next turn.
    pub fn set_model(&mut self, model: &str) -> Vec<String> {
        self.model = Some(model.to_string());
        self.model_override = Some(model.to_string());
        Vec::new()
    }

    pub fn interrupt(&mut self) -> Vec<String> {
        let (Some(thread_id), Some(turn_id)) = (self.thread_id.clone(), self.turn_id.clone())
        else {
            return Vec::new();
        };
        vec![self.request(
            PendingRequest::TurnInterrupt,
            "turn/interrupt",
            json!({ "threadId": thread_id, "turnId": turn_id }),
        )]
    }

    /// `None` when no approval with this id is waiting for an answer.
    pub fn permission_response(&mut self, request_id: &str, allow: bool) -> Option<String> {
        let raw_id = self.approvals.remove(request_id)?;
        let decision = if allow { "accept" } else { "decline" };
        Some(json!({ "id": raw_id, "result": { "decision": decision } }).to_string())
    }

    fn request(&mut self, kind: PendingRequest, method: &str, params: Value) -> String {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, kind);
        json!({ "id": id, "method": method, "params": params }).to_string()
    }

    fn turn_start(&mut self, text: &str) -> String {
        let mut params = json!({
            "threadId": self.thread_id,
            "input": [{ "type": "text", "text": text }],
        });
        if let Some(model) = self.model_override.take() {
            params["model"] = Value::String(model);
        }
        self.request(PendingRequest::TurnStart, "turn/start", params)
    }

    fn response(&mut self, id: &Value, record: &Value) -> Decoded {
        let mut decoded = Decoded::default();
        let Some(kind) = id.as_u64().and_then(|id| self.pending.remove(&id)) else {
            return decoded;
        };

        if let Some(error) = record.get("error") {
            let message = str_at(error, &["message"])
                .unwrap_or("request failed")
                .to_string();
            tracing::warn!(?kind, %message, "codex request failed");
            decoded.push(AgentEvent::Error { message });
            return decoded;
        }

        let result = record.get("result").cloned().unwrap_or(Value::Null);
        match kind {
            PendingRequest::Initialize => {
                decoded.reply(json!({ "method": "initialized" }).to_string());
                let mut params = json!({ "cwd": self.cwd });
                if let Some(model) = &self.model {
                    params["model"] = Value::String(model.clone());
                }
                let line = self.request(PendingRequest::ThreadStart, "thread/start", params);
                decoded.reply(line);
            }
            PendingRequest::ThreadStart => {
                if let Some(thread_id) = str_at(&result, &["thread", "id"]) {
                    self.thread_id = Some(thread_id.to_string());
                    decoded.push(AgentEvent::Ready);
                    if let Some(model) = str_at(&result, &["model"]) {
                        decoded.push(AgentEvent::Model {
                            model: model.to_string(),
                        });
                    }
                    for text in std::mem::take(&mut self.queued) {
                        let line = self.turn_start(&text);
                        decoded.reply(line);
                    }
                } else {
                    decoded.push(AgentEvent::Error {
                        message: "thread/start returned no thread id".to_string(),
                    });
                }
            }
            PendingRequest::TurnStart => {
                if let Some(turn_id) = str_at(&result, &["turn", "id"]) {
                    self.turn_id = Some(turn_id.to_string());
                }
            }
            PendingRequest::TurnInterrupt => {}
        }
        decoded
    }

    fn notification(&mut self, method: &str, params: Option<&Value>) -> Decoded {
        let null = Value::Null;
        let params = params.unwrap_or(&null);
        let mut decoded = Decoded::default();
        match method {
            "turn/started" => {
                if let Some(turn_id) = str_at(params, &["turn", "id"]) {
                    self.turn_id = Some(turn_id.to_string());
                }
                decoded.push(AgentEvent::Status(SessionStatus::Running));
            }
            "turn/completed" => {
                self.turn_id = None;
                if str_at(params, &["turn", "status"]) == Some("failed") {
                    let message = str_at(params, &["turn", "error", "message"])
                        .unwrap_or("turn failed")
                        .to_string();
                    decoded.push(AgentEvent::Error { message });
                }
                decoded.push(AgentEvent::Status(SessionStatus::Idle));
            }
            "item/agentMessage/delta" => {
                if let Some(text) = str_at(params, &["delta"]) {
                    decoded.push(AgentEvent::Token {
                        text: text.to_string(),
                    });
                }
            }
            "item/started" => match str_at(params, &["item", "type"]) {
                Some("contextCompaction") => {
                    decoded.push(AgentEvent::Status(SessionStatus::Compacting));
                }
                Some("commandExecution") => {
                    let item = &params["item"];
                    decoded.push(AgentEvent::ToolUse {
                        id: str_at(item, &["id"]).unwrap_or_default().to_string(),
                        name: "commandExecution".to_string(),
                        input: json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
                    });
                }
                _ => {}
            },
            "item/completed" => match str_at(params, &["item", "type"]) {
                Some("agentMessage") => {
                    if let Some(text) = str_at(params, &["item", "text"]) {
                        decoded.push(AgentEvent::Message {
                            role: "assistant".to_string(),
                            text: text.to_string(),
                        });
                    }
                }
                Some("contextCompaction") => {
                    decoded.push(AgentEvent::Status(SessionStatus::Running));
                }
                _ => {}
            },
            "thread/compacted" => decoded.push(AgentEvent::Status(SessionStatus::Running)),
            "account/rateLimits/updated" => {
                if let Some(snapshot) = rate_limits_from(params.get("rateLimits")) {
                    decoded.push(AgentEvent::RateLimits(snapshot));
                }
            }
            // Older builds wrap rate limits inside token_count events.
            "codex/event/token_count" => {
                if let Some(snapshot) = rate_limits_from(params.pointer("/msg/rate_limits")) {
                    decoded.push(AgentEvent::RateLimits(snapshot));
                }
            }
            "error" => {
                let message = str_at(params, &["error", "message"])
                    .or_else(|| str_at(params, &["message"]))
                    .unwrap_or("codex error")
                    .to_string();
                decoded.push(AgentEvent::Error { message });
            }
            _ => {}
        }
        decoded
    }

    fn server_request(&mut self, method: &str, id: Value, record: &Value) -> Decoded {
        let mut decoded = Decoded::default();
        let null = Value::Null;
        let params = record.get("params").unwrap_or(&null);
        let tool = match method {
            "item/commandExecution/requestApproval" => "commandExecution",
            "item/fileChange/requestApproval" => "fileChange",
            _ => {
                tracing::debug!(method, "unsupported codex server request");
                decoded.reply(
                    json!({
                        "id": id,
                        "error": { "code": METHOD_NOT_FOUND, "message": format!("unsupported method: {method}") }
                    })
                    .to_string(),
                );
                return decoded;
            }
        };

        let request_id = match &id {
            Value::String(id) => id.clone(),
            other => other.to_string(),
        };
        self.approvals.insert(request_id.clone(), id);
        decoded.push(AgentEvent::PermissionRequest {
            request_id,
            tool: tool.to_string(),
            input: params.clone(),
        });
        decoded
    }
}

fn rate_limits_from(value: Option<&Value>) -> Option<RateLimitSnapshot> {
    let value = value?;
    match serde_json::from_value::<RateLimitSnapshot>(value.clone()) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::debug!(error = %err, "malformed codex rate limits");
            None
        }
    }
}
