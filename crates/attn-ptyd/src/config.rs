//! Daemon configuration: TOML file + CLI overrides.

use crate::session::{AgentExecutables, Capacity, ManagerConfig, SessionOptions};
use attn_core::{AttnError, AttnResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.attn/ptyd.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub pty: PtySection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub capture: CaptureSection,
}

/// `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[pty]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PtySection {
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default)]
    pub scrollback_chunks: Option<usize>,
    #[serde(default = "default_attachment_queue")]
    pub attachment_queue: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_max_withhold")]
    pub max_withhold_bytes: usize,
    #[serde(default = "default_exit_grace")]
    pub exit_grace_secs: u64,
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for PtySection {
    fn default() -> Self {
        Self {
            scrollback_bytes: default_scrollback_bytes(),
            scrollback_chunks: None,
            attachment_queue: default_attachment_queue(),
            outbound_queue: default_outbound_queue(),
            max_withhold_bytes: default_max_withhold(),
            exit_grace_secs: default_exit_grace(),
            kill_timeout_secs: default_kill_timeout(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

/// `[agents]` section: executables launched per agent kind.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_claude")]
    pub claude: String,
    #[serde(default = "default_codex")]
    pub codex: String,
    #[serde(default = "default_copilot")]
    pub copilot: String,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            claude: default_claude(),
            codex: default_codex(),
            copilot: default_copilot(),
        }
    }
}

/// `[capture]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureSection {
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:9849".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_scrollback_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_attachment_queue() -> usize {
    256
}
fn default_outbound_queue() -> usize {
    1024
}
fn default_max_withhold() -> usize {
    4096
}
fn default_exit_grace() -> u64 {
    300
}
fn default_kill_timeout() -> u64 {
    10
}
fn default_gc_interval() -> u64 {
    30
}
fn default_claude() -> String {
    "claude".to_string()
}
fn default_codex() -> String {
    "codex".to_string()
}
fn default_copilot() -> String {
    "copilot".to_string()
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub scrollback_bytes: Option<usize>,
    pub max_sessions: Option<usize>,
    pub capture_dir: Option<String>,
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_sessions: usize,
    pub capacity: Capacity,
    pub attachment_queue: usize,
    pub outbound_queue: usize,
    pub max_withhold: usize,
    pub exit_grace: Duration,
    pub kill_timeout: Duration,
    pub gc_interval: Duration,
    pub agents: AgentExecutables,
    pub capture_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pty = PtySection::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9849)),
            max_sessions: default_max_sessions(),
            capacity: Capacity::bytes(pty.scrollback_bytes),
            attachment_queue: pty.attachment_queue,
            outbound_queue: pty.outbound_queue,
            max_withhold: pty.max_withhold_bytes,
            exit_grace: Duration::from_secs(pty.exit_grace_secs),
            kill_timeout: Duration::from_secs(pty.kill_timeout_secs),
            gc_interval: Duration::from_secs(pty.gc_interval_secs),
            agents: AgentExecutables::default(),
            capture_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> AttnResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| AttnError::Config(format!("{}: {e}", expanded.display())))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> AttnResult<Self> {
        let listen_str = cli.listen.unwrap_or(file.daemon.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| AttnError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let max_bytes = cli.scrollback_bytes.unwrap_or(file.pty.scrollback_bytes);
        if max_bytes == 0 {
            return Err(AttnError::Config("scrollback_bytes must be positive".into()));
        }
        let max_sessions = cli.max_sessions.unwrap_or(file.daemon.max_sessions);
        if max_sessions == 0 {
            return Err(AttnError::Config("max_sessions must be positive".into()));
        }

        Ok(Self {
            listen,
            max_sessions,
            capacity: Capacity {
                max_bytes,
                max_chunks: file.pty.scrollback_chunks.filter(|&n| n > 0),
            },
            attachment_queue: file.pty.attachment_queue.max(2),
            outbound_queue: file.pty.outbound_queue.max(1),
            max_withhold: file.pty.max_withhold_bytes,
            exit_grace: Duration::from_secs(file.pty.exit_grace_secs),
            kill_timeout: Duration::from_secs(file.pty.kill_timeout_secs),
            gc_interval: Duration::from_secs(file.pty.gc_interval_secs.max(1)),
            agents: AgentExecutables {
                claude: file.agents.claude,
                codex: file.agents.codex,
                copilot: file.agents.copilot,
            },
            capture_dir: cli
                .capture_dir
                .or(file.capture.dir)
                .filter(|d| !d.trim().is_empty())
                .map(|d| expand_tilde_str(&d)),
        })
    }

    /// Settings handed to the session registry.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            session: SessionOptions {
                capacity: self.capacity,
                attachment_queue: self.attachment_queue,
                max_withhold: self.max_withhold,
            },
            max_sessions: self.max_sessions,
            kill_timeout: self.kill_timeout,
            capture_dir: self.capture_dir.clone(),
        }
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
