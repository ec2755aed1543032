//! Error taxonomy shared by the companion core and its HTTP facade.
//!
//! Every error maps onto an RFC 7807 problem document so route handlers never
//! have to decide status codes themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    SessionNotFound,
    TerminalNotFound,
    SessionNotRunning,
    SessionAlreadyActive,
    PermissionRequestNotFound,
    InvalidRequest,
    LaunchFailed,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "urn:agent-companion:error:session_not_found",
            Self::TerminalNotFound => "urn:agent-companion:error:terminal_not_found",
            Self::SessionNotRunning => "urn:agent-companion:error:session_not_running",
            Self::SessionAlreadyActive => "urn:agent-companion:error:session_already_active",
            Self::PermissionRequestNotFound => {
                "urn:agent-companion:error:permission_request_not_found"
            }
            Self::InvalidRequest => "urn:agent-companion:error:invalid_request",
            Self::LaunchFailed => "urn:agent-companion:error:launch_failed",
            Self::StreamError => "urn:agent-companion:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "Session Not Found",
            Self::TerminalNotFound => "Terminal Not Found",
            Self::SessionNotRunning => "Session Not Running",
            Self::SessionAlreadyActive => "Session Already Active",
            Self::PermissionRequestNotFound => "Permission Request Not Found",
            Self::InvalidRequest => "Invalid Request",
            Self::LaunchFailed => "Launch Failed",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::SessionNotFound | Self::TerminalNotFound | Self::PermissionRequestNotFound => 404,
            Self::SessionNotRunning | Self::InvalidRequest => 400,
            Self::SessionAlreadyActive => 409,
            Self::LaunchFailed | Self::StreamError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "terminalId", skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            session_id: None,
            terminal_id: None,
            field: None,
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum CompanionError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("terminal not found: {terminal_id}")]
    TerminalNotFound { terminal_id: String },
    #[error("session is not running: {session_id}")]
    SessionNotRunning { session_id: String },
    #[error("session already active: {session_id}")]
    SessionAlreadyActive { session_id: String },
    #[error("permission request not found: {request_id}")]
    PermissionRequestNotFound { request_id: String },
    #[error("invalid field `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("launch failed: {message}")]
    LaunchFailed {
        message: String,
        /// Set when the failure is caused by caller input (for example a bad cwd).
        client_error: bool,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl CompanionError {
    /// Missing or blank required field.
    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: format!("{field} is required"),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::TerminalNotFound { .. } => ErrorType::TerminalNotFound,
            Self::SessionNotRunning { .. } => ErrorType::SessionNotRunning,
            Self::SessionAlreadyActive { .. } => ErrorType::SessionAlreadyActive,
            Self::PermissionRequestNotFound { .. } => ErrorType::PermissionRequestNotFound,
            Self::Validation { .. } | Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::LaunchFailed { .. } => ErrorType::LaunchFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        match self {
            Self::SessionNotFound { session_id }
            | Self::SessionNotRunning { session_id }
            | Self::SessionAlreadyActive { session_id } => {
                problem.session_id = Some(session_id.clone());
            }
            Self::TerminalNotFound { terminal_id } => {
                problem.terminal_id = Some(terminal_id.clone());
            }
            Self::Validation { field, .. } => {
                problem.field = Some(field.clone());
            }
            Self::LaunchFailed { client_error, .. } if *client_error => {
                problem.status = 400;
            }
            _ => {}
        }
        problem
    }
}
