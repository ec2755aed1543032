//! Backend wire protocols and the backend-agnostic event model.
//!
//! Each backend codec turns stdout records into [`AgentEvent`]s and turns
//! client intents into the lines that backend expects on stdin. Nothing above
//! this module sees a backend-specific payload.

pub mod claude;
pub mod codex;
pub mod framing;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rate_limits::{RateLimitSnapshot, UsageLimits};
use crate::registry::{BackendType, SessionInfo, SessionStatus};

pub use claude::ClaudeCodec;
pub use codex::CodexCodec;
pub use framing::{LineFramer, Record};

/// Something a backend reported, in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The backend finished its handshake and accepts turns.
    Ready,
    Status(SessionStatus),
    Token {
        text: String,
    },
    Message {
        role: String,
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    PermissionRequest {
        request_id: String,
        tool: String,
        input: Value,
    },
    RateLimits(RateLimitSnapshot),
    Model {
        model: String,
    },
    Error {
        message: String,
    },
}

/// Result of decoding one stdout record.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub events: Vec<AgentEvent>,
    /// Lines the codec needs written back to stdin (handshake steps, replies).
    pub replies: Vec<String>,
}

impl Decoded {
    pub fn event(event: AgentEvent) -> Self {
        Self {
            events: vec![event],
            replies: Vec::new(),
        }
    }

    pub fn push(&mut self, event: AgentEvent) {
        self.events.push(event);
    }

    pub fn reply(&mut self, line: String) {
        self.replies.push(line);
    }
}

/// Frames a client sends over the session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    UserMessage {
        content: String,
    },
    SetModel {
        model: String,
    },
    Interrupt,
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        request_id: String,
        allow: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Ping,
}

/// Frames the bridge sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Session {
        session: SessionInfo,
    },
    Status {
        status: SessionStatus,
    },
    Token {
        text: String,
    },
    Message {
        role: String,
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        tool: String,
        input: Value,
    },
    RateLimits {
        limits: UsageLimits,
    },
    UserMessage {
        content: String,
    },
    Model {
        model: String,
    },
    Error {
        message: String,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Exited {
        exit_code: Option<i32>,
    },
}

/// Per-session protocol state for whichever backend the session runs.
#[derive(Debug)]
pub enum BackendCodec {
    Claude(ClaudeCodec),
    Codex(CodexCodec),
}

impl BackendCodec {
    pub fn new(backend: BackendType, session_id: &str, cwd: &str, model: Option<&str>) -> Self {
        match backend {
            BackendType::Claude => Self::Claude(ClaudeCodec::new(session_id)),
            BackendType::Codex => Self::Codex(CodexCodec::new(cwd, model)),
        }
    }

    pub fn backend(&self) -> BackendType {
        match self {
            Self::Claude(_) => BackendType::Claude,
            Self::Codex(_) => BackendType::Codex,
        }
    }

    /// Lines to write right after spawn.
    pub fn handshake(&mut self) -> Vec<String> {
        match self {
            Self::Claude(codec) => codec.handshake(),
            Self::Codex(codec) => codec.handshake(),
        }
    }

    pub fn decode(&mut self, record: &Value) -> Decoded {
        match self {
            Self::Claude(codec) => codec.decode(record),
            Self::Codex(codec) => codec.decode(record),
        }
    }

    pub fn encode_user_message(&mut self, text: &str) -> Vec<String> {
        match self {
            Self::Claude(codec) => vec![codec.user_message(text)],
            Self::Codex(codec) => codec.user_message(text),
        }
    }

    pub fn encode_set_model(&mut self, model: &str) -> Vec<String> {
        match self {
            Self::Claude(codec) => vec![codec.set_model(model)],
            Self::Codex(codec) => codec.set_model(model),
        }
    }

    pub fn encode_interrupt(&mut self) -> Vec<String> {
        match self {
            Self::Claude(codec) => vec![codec.interrupt()],
            Self::Codex(codec) => codec.interrupt(),
        }
    }

    pub fn encode_permission_response(
        &mut self,
        request_id: &str,
        allow: bool,
        message: Option<&str>,
    ) -> Option<String> {
        match self {
            Self::Claude(codec) => codec.permission_response(request_id, allow, message),
            Self::Codex(codec) => codec.permission_response(request_id, allow),
        }
    }
}

/// Reads a string at a nested JSON path.
pub(crate) fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}
