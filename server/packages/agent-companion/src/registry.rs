use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use utoipa::ToSchema;

use crate::process::ProcessHandle;
use crate::protocol::{BackendCodec, ServerFrame};
use crate::rate_limits::RateLimitSnapshot;

const FRAME_CHANNEL_CAPACITY: usize = 256;
/// Exited sessions kept for inspection before the oldest are dropped.
pub const DEFAULT_EXITED_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Codex,
    Claude,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Codex => "codex",
            BackendType::Claude => "claude",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Idle,
    Running,
    Compacting,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub backend: BackendType,
    pub cwd: String,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// What the launcher knows about a session before it is registered.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub backend: BackendType,
    pub cwd: String,
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session already active: {session_id}")]
    AlreadyActive { session_id: String },
}

/// Mutable per-session state, guarded by the entry's own lock.
#[derive(Debug)]
pub struct SessionState {
    pub info: SessionInfo,
    pub codec: BackendCodec,
    pub rate_limits: Option<RateLimitSnapshot>,
    pub rate_limits_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub id: String,
    /// Registration order.
    pub seq: u64,
    pub handle: Arc<ProcessHandle>,
    pub state: Mutex<SessionState>,
    pub frames: broadcast::Sender<ServerFrame>,
}

impl SessionEntry {
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub async fn snapshot(&self) -> SessionInfo {
        let state = self.state.lock().await;
        self.reconcile(state.info.clone())
    }

    /// Reports a dead process as exited even before the pump records it.
    fn reconcile(&self, mut info: SessionInfo) -> SessionInfo {
        if !self.handle.is_alive() {
            info.status = SessionStatus::Exited;
            if info.exit_code.is_none() {
                info.exit_code = self.handle.exit_code();
            }
        }
        info
    }

    /// Broadcasts to attached sockets; having none is fine.
    pub fn publish(&self, frame: ServerFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }
}

/// Session id to live session. The table lock is only held for lookups and
/// insert/remove; everything else goes through the entry's own lock.
///
/// Exited sessions stay listed until deleted, but only the newest
/// `exited_limit` of them survive the next registration.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    next_seq: AtomicU64,
    exited_limit: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_exited_limit(DEFAULT_EXITED_LIMIT)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exited_limit(exited_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            exited_limit,
        }
    }

    /// Inserts a session. A dead session holding the same id is replaced.
    pub async fn register(
        &self,
        id: &str,
        handle: Arc<ProcessHandle>,
        metadata: SessionMetadata,
    ) -> Result<Arc<SessionEntry>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            if existing.is_alive() {
                return Err(RegistryError::AlreadyActive {
                    session_id: id.to_string(),
                });
            }
            tracing::debug!(session_id = id, "replacing exited session");
        }

        let codec = BackendCodec::new(
            metadata.backend,
            id,
            &metadata.cwd,
            metadata.model.as_deref(),
        );
        let info = SessionInfo {
            id: id.to_string(),
            backend: metadata.backend,
            cwd: metadata.cwd,
            model: metadata.model,
            status: SessionStatus::Starting,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            pid: handle.pid(),
            exit_code: None,
        };
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let entry = Arc::new(SessionEntry {
            id: id.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            handle,
            state: Mutex::new(SessionState {
                info,
                codec,
                rate_limits: None,
                rate_limits_at: None,
            }),
            frames,
        });
        sessions.insert(id.to_string(), entry.clone());
        prune_exited(&mut sessions, self.exited_limit);
        Ok(entry)
    }

    pub async fn entry(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        let entry = self.entry(id).await?;
        Some(entry.snapshot().await)
    }

    pub async fn is_alive(&self, id: &str) -> bool {
        self.entry(id)
            .await
            .map(|entry| entry.is_alive())
            .unwrap_or(false)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.write().await.remove(id)
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.snapshot().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Most recently reported Codex rate limits across every session.
    pub async fn latest_rate_limits(&self) -> Option<RateLimitSnapshot> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut latest: Option<(DateTime<Utc>, RateLimitSnapshot)> = None;
        for entry in entries {
            let state = entry.state.lock().await;
            let (Some(at), Some(snapshot)) = (state.rate_limits_at, state.rate_limits.as_ref())
            else {
                continue;
            };
            if latest.as_ref().map(|(seen, _)| at > *seen).unwrap_or(true) {
                latest = Some((at, snapshot.clone()));
            }
        }
        latest.map(|(_, snapshot)| snapshot)
    }
}

fn prune_exited(sessions: &mut HashMap<String, Arc<SessionEntry>>, limit: usize) {
    let mut exited: Vec<(u64, String)> = sessions
        .values()
        .filter(|entry| !entry.is_alive())
        .map(|entry| (entry.seq, entry.id.clone()))
        .collect();
    if exited.len() <= limit {
        return;
    }
    exited.sort_unstable();
    let excess = exited.len() - limit;
    for (_, id) in exited.into_iter().take(excess) {
        sessions.remove(&id);
        tracing::debug!(session_id = %id, "dropping old exited session");
    }
}
