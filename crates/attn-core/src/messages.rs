//! Wire messages exchanged between the UI client and the PTY daemon.
//!
//! Every message is one JSON object. Commands (client → daemon) are tagged
//! by `cmd`, events (daemon → client) by `event`. Raw terminal bytes travel
//! base64-encoded in `data` fields.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const CMD_SPAWN_SESSION: &str = "spawn_session";
pub const CMD_ATTACH_SESSION: &str = "attach_session";
pub const CMD_DETACH_SESSION: &str = "detach_session";
pub const CMD_PTY_INPUT: &str = "pty_input";
pub const CMD_PTY_RESIZE: &str = "pty_resize";
pub const CMD_KILL_SESSION: &str = "kill_session";
pub const CMD_LIST_SESSIONS: &str = "list_sessions";
pub const CMD_SET_SESSION_STATE: &str = "set_session_state";

/// Kind of program a session wraps. Selects the launch command and which
/// output classifier (if any) watches the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Shell,
    Claude,
    Codex,
    Copilot,
}

impl AgentKind {
    /// Parse a loosely-specified agent name. Empty and unrecognised names
    /// fall back to `Codex`.
    pub fn normalize(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("shell") => AgentKind::Shell,
            Some("claude") => AgentKind::Claude,
            Some("copilot") => AgentKind::Copilot,
            _ => AgentKind::Codex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Shell => "shell",
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Copilot => "copilot",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attention state of the agent running inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Working,
    WaitingInput,
    PendingApproval,
    Idle,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Working => "working",
            AgentState::WaitingInput => "waiting_input",
            AgentState::PendingApproval => "pending_approval",
            AgentState::Idle => "idle",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process lifecycle of a session. `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Spawning,
    Running,
    Exited,
}

/// One sequenced unit of terminal output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub seq: u64,
    #[serde(with = "crate::codec::base64_bytes")]
    pub data: Vec<u8>,
}

// ── Commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnSessionPayload {
    pub id: String,
    pub cwd: String,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Explicit program to run. When absent the agent kind decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSessionPayload {
    pub id: String,
    /// Last sequence number the client has rendered. Absent or 0 replays
    /// everything still retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyInputPayload {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyResizePayload {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSessionPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSessionStatePayload {
    pub id: String,
    pub state: AgentState,
}

/// Client → daemon command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    SpawnSession(SpawnSessionPayload),
    AttachSession(AttachSessionPayload),
    DetachSession(SessionIdPayload),
    PtyInput(PtyInputPayload),
    PtyResize(PtyResizePayload),
    KillSession(KillSessionPayload),
    ListSessions,
    SetSessionState(SetSessionStatePayload),
}

impl Command {
    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SpawnSession(_) => CMD_SPAWN_SESSION,
            Command::AttachSession(_) => CMD_ATTACH_SESSION,
            Command::DetachSession(_) => CMD_DETACH_SESSION,
            Command::PtyInput(_) => CMD_PTY_INPUT,
            Command::PtyResize(_) => CMD_PTY_RESIZE,
            Command::KillSession(_) => CMD_KILL_SESSION,
            Command::ListSessions => CMD_LIST_SESSIONS,
            Command::SetSessionState(_) => CMD_SET_SESSION_STATE,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResultPayload {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachResultPayload {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Replayed output, oldest first.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// Newest sequence number at the moment of the snapshot. Live
    /// `pty_output` for this attachment starts at `last_seq + 1`.
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether older output has already been evicted from the buffer.
    #[serde(default)]
    pub truncated: bool,
}

impl AttachResultPayload {
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.into()),
            chunks: Vec::new(),
            last_seq: 0,
            cols: 0,
            rows: 0,
            pid: None,
            running: false,
            exit_code: None,
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyOutputPayload {
    pub id: String,
    pub seq: u64,
    #[serde(with = "crate::codec::base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExitedPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Why a client's view of a session can no longer be continued gaplessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncReason {
    /// The requested resume point was evicted from the replay buffer.
    ReplayWindowExceeded,
    /// The client fell behind live output and was detached.
    BufferOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyDesyncPayload {
    pub id: String,
    pub reason: DesyncReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandErrorPayload {
    pub cmd: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub agent: AgentKind,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub lifecycle: Lifecycle,
    pub cols: u16,
    pub rows: u16,
    pub last_seq: u64,
    pub attachments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListPayload {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatePayload {
    pub id: String,
    pub state: AgentState,
}

/// Daemon → client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SpawnResult(SpawnResultPayload),
    AttachResult(AttachResultPayload),
    PtyOutput(PtyOutputPayload),
    SessionExited(SessionExitedPayload),
    PtyDesync(PtyDesyncPayload),
    CommandError(CommandErrorPayload),
    SessionList(SessionListPayload),
    SessionState(SessionStatePayload),
}

impl Event {
    pub fn command_error(cmd: impl Into<String>, error: impl Into<String>) -> Self {
        Event::CommandError(CommandErrorPayload {
            cmd: cmd.into(),
            error: error.into(),
        })
    }

    pub fn desync(id: impl Into<String>, reason: DesyncReason) -> Self {
        Event::PtyDesync(PtyDesyncPayload {
            id: id.into(),
            reason,
        })
    }
}
