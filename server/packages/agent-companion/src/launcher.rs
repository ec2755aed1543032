use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agent_companion_error::CompanionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::process::{ProcessError, ProcessHandle, ProcessSpec, Signal};
use crate::registry::{BackendType, RegistryError, SessionInfo, SessionMetadata, SessionRegistry};
use crate::ws_bridge::WsBridge;

/// How to invoke one backend CLI. `prefix_args` go before the generated
/// arguments (e.g. a wrapper script or `npx <pkg>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl BackendCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How long a backend gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub claude: BackendCommand,
    pub codex: BackendCommand,
    pub stop_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            claude: BackendCommand::new("claude"),
            codex: BackendCommand::new("codex"),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl LauncherConfig {
    pub fn command_for(&self, backend: BackendType) -> &BackendCommand {
        match backend {
            BackendType::Claude => &self.claude,
            BackendType::Codex => &self.codex,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub backend: BackendType,
    pub cwd: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid working directory `{cwd}`: {reason}")]
    InvalidCwd { cwd: String, reason: String },
    #[error(transparent)]
    Spawn(#[from] ProcessError),
    #[error("session already active: {session_id}")]
    AlreadyActive { session_id: String },
}

impl From<RegistryError> for LaunchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyActive { session_id } => Self::AlreadyActive { session_id },
        }
    }
}

impl From<LaunchError> for CompanionError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::InvalidCwd { .. } => CompanionError::LaunchFailed {
                message: err.to_string(),
                client_error: true,
            },
            LaunchError::Spawn(_) => CompanionError::LaunchFailed {
                message: err.to_string(),
                client_error: false,
            },
            LaunchError::AlreadyActive { session_id } => {
                CompanionError::SessionAlreadyActive { session_id }
            }
        }
    }
}

/// Spawns backend CLIs and hands them to the bridge.
#[derive(Debug)]
pub struct CliLauncher {
    config: LauncherConfig,
    registry: Arc<SessionRegistry>,
    bridge: WsBridge,
}

impl CliLauncher {
    pub fn new(config: LauncherConfig, registry: Arc<SessionRegistry>, bridge: WsBridge) -> Self {
        Self {
            config,
            registry,
            bridge,
        }
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<SessionInfo, LaunchError> {
        validate_cwd(&request.cwd)?;
        let model = request
            .model
            .filter(|model| !model.trim().is_empty());
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Fail before spawning when the id is taken by a live process.
        if self.registry.is_alive(&session_id).await {
            return Err(LaunchError::AlreadyActive { session_id });
        }

        let spec = build_spec(
            self.config.command_for(request.backend),
            request.backend,
            &request.cwd,
            model.as_deref(),
        );
        tracing::info!(
            session_id = %session_id,
            backend = request.backend.as_str(),
            command = %spec.display(),
            "launching backend"
        );
        let handle = Arc::new(ProcessHandle::spawn(spec)?);

        let metadata = SessionMetadata {
            backend: request.backend,
            cwd: request.cwd,
            model,
        };
        let entry = match self
            .registry
            .register(&session_id, handle.clone(), metadata)
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                handle.kill(Signal::Kill);
                return Err(err.into());
            }
        };

        self.bridge.track(entry.clone()).await;
        Ok(entry.snapshot().await)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.registry.get(session_id).await
    }

    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.registry.is_alive(session_id).await
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    /// Stops the backend and forgets the session. A backend still running
    /// `stop_timeout` after SIGTERM is killed.
    pub async fn terminate(&self, session_id: &str) -> Result<(), CompanionError> {
        let entry = self
            .registry
            .entry(session_id)
            .await
            .ok_or_else(|| CompanionError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if entry.is_alive() {
            entry.handle.kill(Signal::Terminate);
            let exit_code =
                match tokio::time::timeout(self.config.stop_timeout, entry.handle.wait()).await {
                    Ok(exit_code) => exit_code,
                    Err(_) => {
                        tracing::warn!(session_id, "backend ignored SIGTERM, killing");
                        entry.handle.kill(Signal::Kill);
                        entry.handle.wait().await
                    }
                };
            tracing::info!(session_id, ?exit_code, "session terminated");
        }
        self.registry.remove(session_id).await;
        Ok(())
    }
}

fn validate_cwd(cwd: &str) -> Result<(), LaunchError> {
    let invalid = |reason: &str| LaunchError::InvalidCwd {
        cwd: cwd.to_string(),
        reason: reason.to_string(),
    };
    if cwd.trim().is_empty() {
        return Err(invalid("must not be empty"));
    }
    let path = Path::new(cwd);
    if !path.is_absolute() {
        return Err(invalid("must be an absolute path"));
    }
    if !path.is_dir() {
        return Err(invalid("directory does not exist"));
    }
    Ok(())
}

/// Backend command line for a session.
pub fn build_spec(
    command: &BackendCommand,
    backend: BackendType,
    cwd: &str,
    model: Option<&str>,
) -> ProcessSpec {
    let mut args = command.prefix_args.clone();
    match backend {
        BackendType::Codex => {
            args.push("app-server".to_string());
            if let Some(model) = model {
                args.push("-c".to_string());
                args.push(format!("model=\"{model}\""));
            }
        }
        BackendType::Claude => {
            args.extend(
                [
                    "-p",
                    "--input-format",
                    "stream-json",
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--include-partial-messages",
                    "--permission-prompt-tool",
                    "stdio",
                ]
                .map(String::from),
            );
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
        }
    }
    ProcessSpec::new(command.program.clone())
        .args(args)
        .cwd(cwd)
}
