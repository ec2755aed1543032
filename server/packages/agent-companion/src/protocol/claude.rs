//! Claude CLI `stream-json` protocol.
//!
//! The CLI runs as `claude -p --input-format stream-json --output-format
//! stream-json`. Input lines are user turns or control requests; output lines
//! are tagged by `type` (`system`, `assistant`, `stream_event`, `result`,
//! `control_request`, `control_response`).

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{str_at, AgentEvent, Decoded};
use crate::registry::SessionStatus;

const INITIALIZE_REQUEST_ID: &str = "companion-init";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeOutput {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    StreamEvent {
        event: Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: Value,
    },
    ControlResponse {
        response: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug)]
pub struct ClaudeCodec {
    session_id: String,
    native_session_id: Option<String>,
    next_request: u64,
    /// Tool inputs of outstanding permission prompts, echoed back on allow.
    pending_permissions: HashMap<String, Value>,
}

impl ClaudeCodec {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            native_session_id: None,
            next_request: 1,
            pending_permissions: HashMap::new(),
        }
    }

    pub fn handshake(&mut self) -> Vec<String> {
        vec![json!({
            "type": "control_request",
            "request_id": INITIALIZE_REQUEST_ID,
            "request": { "subtype": "initialize", "hooks": null },
        })
        .to_string()]
    }

    pub fn decode(&mut self, record: &Value) -> Decoded {
        let output = match ClaudeOutput::deserialize(record) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(error = %err, "unrecognized claude record");
                return Decoded::default();
            }
        };

        let mut decoded = Decoded::default();
        match output {
            ClaudeOutput::System {
                subtype,
                session_id,
                model,
                status,
            } => match subtype.as_deref() {
                Some("init") => {
                    if session_id.is_some() {
                        self.native_session_id = session_id;
                    }
                    decoded.push(AgentEvent::Ready);
                    if let Some(model) = model {
                        decoded.push(AgentEvent::Model { model });
                    }
                }
                Some("status") => {
                    let next = match status.as_deref() {
                        Some("compacting") => SessionStatus::Compacting,
                        _ => SessionStatus::Running,
                    };
                    decoded.push(AgentEvent::Status(next));
                }
                Some("compact_boundary") => {
                    decoded.push(AgentEvent::Status(SessionStatus::Running));
                }
                _ => {}
            },
            ClaudeOutput::Assistant { message } => {
                decoded.push(AgentEvent::Status(SessionStatus::Running));
                let mut text = String::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text: part } => text.push_str(&part),
                        ContentBlock::ToolUse { id, name, input } => {
                            decoded.push(AgentEvent::ToolUse { id, name, input });
                        }
                        ContentBlock::Other => {}
                    }
                }
                if !text.is_empty() {
                    decoded.push(AgentEvent::Message {
                        role: "assistant".to_string(),
                        text,
                    });
                }
            }
            ClaudeOutput::StreamEvent { event } => match str_at(&event, &["type"]) {
                Some("message_start") => {
                    decoded.push(AgentEvent::Status(SessionStatus::Running));
                }
                Some("content_block_delta") => {
                    if str_at(&event, &["delta", "type"]) == Some("text_delta") {
                        if let Some(text) = str_at(&event, &["delta", "text"]) {
                            decoded.push(AgentEvent::Token {
                                text: text.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            },
            ClaudeOutput::Result {
                is_error,
                result,
                session_id,
            } => {
                if session_id.is_some() {
                    self.native_session_id = session_id;
                }
                if is_error {
                    decoded.push(AgentEvent::Error {
                        message: result.unwrap_or_else(|| "turn failed".to_string()),
                    });
                }
                decoded.push(AgentEvent::Status(SessionStatus::Idle));
            }
            ClaudeOutput::ControlRequest {
                request_id,
                request,
            } => match str_at(&request, &["subtype"]) {
                Some("can_use_tool") => {
                    let tool = str_at(&request, &["tool_name"])
                        .unwrap_or("unknown")
                        .to_string();
                    let input = request.get("input").cloned().unwrap_or(Value::Null);
                    self.pending_permissions
                        .insert(request_id.clone(), input.clone());
                    decoded.push(AgentEvent::PermissionRequest {
                        request_id,
                        tool,
                        input,
                    });
                }
                other => {
                    tracing::debug!(subtype = ?other, "unsupported claude control request");
                    decoded.reply(control_error_line(&request_id, "unsupported control request"));
                }
            },
            ClaudeOutput::ControlResponse { response } => {
                let request_id = str_at(&response, &["request_id"]);
                let subtype = str_at(&response, &["subtype"]);
                if subtype == Some("error") {
                    let message = str_at(&response, &["error"])
                        .unwrap_or("control request failed")
                        .to_string();
                    decoded.push(AgentEvent::Error { message });
                } else if request_id == Some(INITIALIZE_REQUEST_ID) {
                    decoded.push(AgentEvent::Ready);
                }
            }
            ClaudeOutput::Other => {}
        }
        decoded
    }

    pub fn user_message(&mut self, text: &str) -> String {
        json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": text,
            },
            "parent_tool_use_id": null,
            "session_id": self.input_session_id(),
        })
        .to_string()
    }

    pub fn set_model(&mut self, model: &str) -> String {
        self.control_request(json!({ "subtype": "set_model", "model": model }))
    }

    pub fn interrupt(&mut self) -> String {
        self.control_request(json!({ "subtype": "interrupt" }))
    }

    pub fn permission_response(
        &mut self,
        request_id: &str,
        allow: bool,
        message: Option<&str>,
    ) -> Option<String> {
        let input = self.pending_permissions.remove(request_id)?;
        let response = if allow {
            json!({ "behavior": "allow", "updatedInput": input })
        } else {
            json!({
                "behavior": "deny",
                "message": message.unwrap_or("Denied by user"),
            })
        };
        Some(
            json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": response,
                }
            })
            .to_string(),
        )
    }

    fn input_session_id(&self) -> String {
        self.native_session_id
            .clone()
            .unwrap_or_else(|| self.session_id.clone())
    }

    fn control_request(&mut self, request: Value) -> String {
        let request_id = format!("companion-{}", self.next_request);
        self.next_request += 1;
        json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        })
        .to_string()
    }
}

fn control_error_line(request_id: &str, error: &str) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        }
    })
    .to_string()
}
