//! Process handles for agent backends and interactive shells.
//!
//! A handle owns one OS process. Output is delivered in production order on a
//! single stream taken by the owner, stdin writes go through a writer task,
//! and the exit transition is published exactly once on a `watch` channel so
//! every holder observes the same state.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use utoipa::ToSchema;

const READ_BUFFER_SIZE: usize = 8192;

/// Default terminal size (columns x rows)
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set up pty: {message}")]
    Pty { message: String },
    #[error("process is not running")]
    Closed,
    #[error("process does not have a pty")]
    NotPty,
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = mpsc::UnboundedReceiver<OutputChunk>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite request (SIGTERM on unix).
    Terminate,
    /// Forced kill.
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

pub struct ProcessHandle {
    pid: Option<u32>,
    command: String,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    output: Mutex<Option<OutputStream>>,
    state: watch::Receiver<ProcessState>,
    control: mpsc::UnboundedSender<Signal>,
    pty: Option<Mutex<Box<dyn MasterPty + Send>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("state", &*self.state.borrow())
            .field("has_pty", &self.pty.is_some())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawns a process with piped stdio. Must be called inside a tokio runtime.
    pub fn spawn(spec: ProcessSpec) -> Result<Self, ProcessError> {
        let command_line = spec.display();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Signal>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_reader(stdout, output_tx.clone(), OutputChunk::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_reader(stderr, output_tx, OutputChunk::Stderr));
        }
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(bytes) = stdin_rx.recv().await {
                    if stdin.write_all(&bytes).await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(signal) = control_rx.recv() => match signal {
                        Signal::Terminate => terminate_pid(pid, || child.start_kill()),
                        Signal::Kill => {
                            if let Err(err) = child.start_kill() {
                                tracing::debug!(?pid, error = %err, "kill failed");
                            }
                        }
                    },
                }
            };
            let code = match status {
                Ok(status) => exit_code(&status),
                Err(err) => {
                    tracing::warn!(?pid, error = %err, "failed to wait on process");
                    None
                }
            };
            tracing::debug!(?pid, ?code, "process exited");
            state_tx.send_replace(ProcessState::Exited { code });
        });

        tracing::debug!(?pid, command = %command_line, "spawned process");
        Ok(Self {
            pid,
            command: command_line,
            stdin: stdin_tx,
            output: Mutex::new(Some(output_rx)),
            state: state_rx,
            control: control_tx,
            pty: None,
        })
    }

    /// Spawns a process attached to a new pseudo-terminal. Output arrives as
    /// [`OutputChunk::Stdout`] since a pty merges both streams.
    pub fn spawn_pty(spec: ProcessSpec, size: TerminalSize) -> Result<Self, ProcessError> {
        let command_line = spec.display();
        let PtyPair { master, slave } = native_pty_system()
            .openpty(size.into())
            .map_err(|e| ProcessError::Pty {
                message: format!("failed to create pty: {e}"),
            })?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = slave.spawn_command(cmd).map_err(|e| ProcessError::Spawn {
            command: command_line.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        // The child holds its own copy; ours would keep the pty open after exit.
        drop(slave);

        let pid = child.process_id();
        let mut writer = master.take_writer().map_err(|e| ProcessError::Pty {
            message: format!("failed to get pty writer: {e}"),
        })?;
        let mut reader = master.try_clone_reader().map_err(|e| ProcessError::Pty {
            message: format!("failed to get pty reader: {e}"),
        })?;
        let mut killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Signal>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(OutputChunk::Stdout(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("pty read error: {}", e);
                        break;
                    }
                }
            }
        });

        std::thread::spawn(move || {
            while let Some(bytes) = stdin_rx.blocking_recv() {
                if writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(err) => {
                    tracing::warn!(?pid, error = %err, "failed to wait on pty process");
                    None
                }
            };
            tracing::debug!(?pid, ?code, "pty process exited");
            state_tx.send_replace(ProcessState::Exited { code });
        });

        let mut exit_rx = state_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = control_rx.recv() => match signal {
                        Some(Signal::Terminate) => terminate_pid(pid, || killer.kill()),
                        Some(Signal::Kill) => {
                            if let Err(err) = killer.kill() {
                                tracing::debug!(?pid, error = %err, "kill failed");
                            }
                        }
                        None => break,
                    },
                    _ = exit_rx.wait_for(|state| !state.is_running()) => break,
                }
            }
        });

        tracing::debug!(?pid, command = %command_line, "spawned pty process");
        Ok(Self {
            pid,
            command: command_line,
            stdin: stdin_tx,
            output: Mutex::new(Some(output_rx)),
            state: state_rx,
            control: control_tx,
            pty: Some(Mutex::new(master)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_alive(&self) -> bool {
        self.state.borrow().is_running()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match *self.state.borrow() {
            ProcessState::Exited { code } => code,
            ProcessState::Running => None,
        }
    }

    /// Queues bytes for the process's stdin.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::Closed);
        }
        self.stdin
            .send(bytes.into())
            .map_err(|_| ProcessError::Closed)
    }

    /// Takes the output stream. Only the first caller gets it.
    pub fn take_output(&self) -> Option<OutputStream> {
        self.output.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn subscribe_exit(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Requests termination. Does nothing when the process is already gone.
    pub fn kill(&self, signal: Signal) {
        if !self.is_alive() {
            return;
        }
        let _ = self.control.send(signal);
    }

    /// Resolves once the process has exited, with its exit code if known.
    pub async fn wait(&self) -> Option<i32> {
        let mut exit = self.state.clone();
        let code = match exit.wait_for(|state| !state.is_running()).await {
            Ok(state) => match *state {
                ProcessState::Exited { code } => code,
                ProcessState::Running => None,
            },
            Err(_) => None,
        };
        code
    }

    pub fn resize(&self, size: TerminalSize) -> Result<(), ProcessError> {
        let pty = self.pty.as_ref().ok_or(ProcessError::NotPty)?;
        let master = pty.lock().map_err(|_| ProcessError::Pty {
            message: "pty lock poisoned".to_string(),
        })?;
        master.resize(size.into()).map_err(|e| ProcessError::Pty {
            message: format!("failed to resize terminal: {e}"),
        })
    }
}

async fn pump_reader<R>(
    mut reader: R,
    sender: mpsc::UnboundedSender<OutputChunk>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if sender.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "pipe read error");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn terminate_pid<F>(pid: Option<u32>, fallback: F)
where
    F: FnOnce() -> std::io::Result<()>,
{
    match pid {
        Some(pid) => unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        },
        None => {
            if let Err(err) = fallback() {
                tracing::debug!(error = %err, "terminate failed");
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_pid<F>(_pid: Option<u32>, fallback: F)
where
    F: FnOnce() -> std::io::Result<()>,
{
    if let Err(err) = fallback() {
        tracing::debug!(error = %err, "terminate failed");
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}
