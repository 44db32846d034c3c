//! PTY processes using portable-pty.
//!
//! Opens a pseudo-terminal for a session's command at a given size and
//! working directory. The rest of the daemon only sees the [`PtyProcess`]
//! trait, so the reader loop and attachment logic do not depend on a real
//! terminal.

use attn_core::{AgentKind, AttnError, AttnResult};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Everything needed to start a session's process.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub id: String,
    pub agent: AgentKind,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Explicit program; when `None` the agent kind decides.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub label: Option<String>,
}

/// Signal requested by `kill_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Int,
    Hup,
    Kill,
}

impl KillSignal {
    /// Parse a signal name (`TERM`, `SIGINT`, ...). Unknown names mean TERM.
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_uppercase()).as_deref() {
            Some("SIGINT" | "INT") => KillSignal::Int,
            Some("SIGHUP" | "HUP") => KillSignal::Hup,
            Some("SIGKILL" | "KILL") => KillSignal::Kill,
            _ => KillSignal::Term,
        }
    }
}

/// A running process attached to a PTY.
pub trait PtyProcess: Send + Sync {
    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;

    /// Take the output side. Succeeds once.
    fn take_reader(&self) -> AttnResult<Box<dyn Read + Send>>;

    /// Take the input side. Succeeds once.
    fn take_writer(&self) -> AttnResult<Box<dyn Write + Send>>;

    fn resize(&self, cols: u16, rows: u16) -> AttnResult<()>;

    /// Deliver a signal to the process group. Must not block on the
    /// reader or on `wait`.
    fn signal(&self, signal: KillSignal) -> AttnResult<()>;

    /// Block until the process exits; returns its exit code when known.
    fn wait(&self) -> AttnResult<Option<i32>>;
}

/// Creates PTY processes. One implementation talks to the OS; tests
/// substitute an in-memory one.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> AttnResult<Box<dyn PtyProcess>>;
}

/// Executables launched for each agent kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExecutables {
    pub claude: String,
    pub codex: String,
    pub copilot: String,
}

impl Default for AgentExecutables {
    fn default() -> Self {
        Self {
            claude: "claude".into(),
            codex: "codex".into(),
            copilot: "copilot".into(),
        }
    }
}

impl AgentExecutables {
    fn for_agent(&self, agent: AgentKind) -> Option<&str> {
        match agent {
            AgentKind::Claude => Some(&self.claude),
            AgentKind::Codex => Some(&self.codex),
            AgentKind::Copilot => Some(&self.copilot),
            AgentKind::Shell => None,
        }
    }
}

/// Spawns real processes on a native pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct NativeSpawner {
    executables: AgentExecutables,
}

impl NativeSpawner {
    pub fn new(executables: AgentExecutables) -> Self {
        Self { executables }
    }

    fn open(&self, spec: &SpawnSpec, program: &str, args: &[String]) -> AttnResult<NativeProcess> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| AttnError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(&spec.cwd);
        apply_env(&mut cmd, spec);

        let child = pair.slave.spawn_command(cmd).map_err(|e| spawn_error(program, e))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AttnError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AttnError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

        Ok(NativeProcess {
            pid: child.process_id(),
            killer: Mutex::new(child.clone_killer()),
            child: Mutex::new(child),
            master: Mutex::new(pair.master),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

impl PtySpawner for NativeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> AttnResult<Box<dyn PtyProcess>> {
        if !spec.cwd.is_dir() {
            return Err(AttnError::SpawnFailed(format!(
                "working directory does not exist: {}",
                spec.cwd.display()
            )));
        }

        if let Some(program) = &spec.command {
            let process = self.open(spec, program, &spec.args)?;
            info!(session_id = %spec.id, program = %program, pid = ?process.pid, "PTY spawned");
            return Ok(Box::new(process));
        }

        self.spawn_in_shell(spec, &login_shell())
    }
}

impl NativeSpawner {
    /// Run `spec` through `login_shell`, falling back to the well-known
    /// shells when it is missing or not executable.
    fn spawn_in_shell(&self, spec: &SpawnSpec, login_shell: &str) -> AttnResult<Box<dyn PtyProcess>> {
        let candidates = shell_candidates(login_shell);
        let args = shell_args(spec, self.executables.for_agent(spec.agent));
        let mut last_err = None;
        for (i, shell) in candidates.iter().enumerate() {
            let attempt = if is_executable(shell) {
                self.open(spec, shell, &args).map_err(SpawnAttempt::from)
            } else {
                Err(SpawnAttempt::Fallback(AttnError::SpawnFailed(format!(
                    "shell {shell} does not exist or is not executable"
                ))))
            };
            match attempt {
                Ok(process) => {
                    if shell != login_shell {
                        warn!(session_id = %spec.id, shell = %shell, preferred = %login_shell, "using fallback shell");
                    }
                    info!(
                        session_id = %spec.id,
                        agent = %spec.agent,
                        shell = %shell,
                        pid = ?process.pid,
                        "PTY spawned"
                    );
                    return Ok(Box::new(process));
                }
                Err(SpawnAttempt::Fallback(e)) if i + 1 < candidates.len() => {
                    debug!(session_id = %spec.id, shell = %shell, error = %e, "shell unavailable, trying next");
                    last_err = Some(e);
                }
                Err(SpawnAttempt::Fallback(e)) | Err(SpawnAttempt::Fatal(e)) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AttnError::SpawnFailed("no shell available".into())))
    }
}

/// Whether `program` names an executable file. Bare names are left to the
/// PATH lookup at spawn time.
fn is_executable(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() < 2 {
        return true;
    }
    match std::fs::metadata(path) {
        #[cfg(unix)]
        Ok(meta) => {
            use std::os::unix::fs::PermissionsExt;
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

/// Why a spawn attempt failed: whether another shell is worth trying.
enum SpawnAttempt {
    Fallback(AttnError),
    Fatal(AttnError),
}

impl From<AttnError> for SpawnAttempt {
    fn from(e: AttnError) -> Self {
        match &e {
            AttnError::Io(io) if is_missing_program(io.kind()) => SpawnAttempt::Fallback(e),
            _ => SpawnAttempt::Fatal(e),
        }
    }
}

fn is_missing_program(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}

fn spawn_error(program: &str, e: anyhow::Error) -> AttnError {
    match e.downcast_ref::<std::io::Error>() {
        Some(io) if is_missing_program(io.kind()) => {
            AttnError::Io(std::io::Error::new(io.kind(), format!("{program}: {io}")))
        }
        _ => AttnError::SpawnFailed(format!("failed to spawn {program}: {e}")),
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn apply_env(cmd: &mut CommandBuilder, spec: &SpawnSpec) {
    // A daemon started from inside an agent must not make its children
    // believe they are nested.
    cmd.env_remove("CLAUDECODE");
    cmd.env("TERM", "xterm-256color");
    if spec.agent != AgentKind::Shell {
        cmd.env("ATTN_INSIDE_APP", "1");
        cmd.env("ATTN_DAEMON_MANAGED", "1");
        cmd.env("ATTN_SESSION_ID", &spec.id);
        cmd.env("ATTN_AGENT", spec.agent.as_str());
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
}

/// Arguments for the login shell: interactive for plain shells, `exec` of
/// the agent executable otherwise.
pub fn shell_args(spec: &SpawnSpec, executable: Option<&str>) -> Vec<String> {
    match executable {
        None => vec!["-l".into()],
        Some(exe) => {
            let mut words = vec![exe.to_string()];
            words.extend(spec.args.iter().cloned());
            let line = words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>();
            vec!["-l".into(), "-c".into(), format!("exec {}", line.join(" "))]
        }
    }
}

/// Single-quote a word for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".into();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The user's login shell: `$SHELL`, else `/bin/bash`.
pub fn login_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".into())
}

/// Preferred shell first, then well-known fallbacks, without duplicates.
pub fn shell_candidates(primary: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(4);
    let fallbacks: &[&str] = if cfg!(target_os = "macos") {
        &["/bin/zsh", "/bin/bash", "/bin/sh"]
    } else {
        &["/bin/bash", "/bin/sh"]
    };
    for shell in std::iter::once(primary).chain(fallbacks.iter().copied()) {
        let shell = shell.trim();
        if !shell.is_empty() && !out.iter().any(|s| s == shell) {
            out.push(shell.to_string());
        }
    }
    out
}

/// A process on a native PTY.
pub struct NativeProcess {
    pid: Option<u32>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    /// Separate from `child` so a kill never waits behind a blocked `wait`.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

fn poisoned(what: &str) -> AttnError {
    AttnError::Other(format!("PTY {what} lock poisoned"))
}

impl PtyProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_reader(&self) -> AttnResult<Box<dyn Read + Send>> {
        self.reader
            .lock()
            .map_err(|_| poisoned("reader"))?
            .take()
            .ok_or_else(|| AttnError::Other("PTY reader already taken".into()))
    }

    fn take_writer(&self) -> AttnResult<Box<dyn Write + Send>> {
        self.writer
            .lock()
            .map_err(|_| poisoned("writer"))?
            .take()
            .ok_or_else(|| AttnError::Other("PTY writer already taken".into()))
    }

    fn resize(&self, cols: u16, rows: u16) -> AttnResult<()> {
        let master = self.master.lock().map_err(|_| poisoned("master"))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| AttnError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn signal(&self, signal: KillSignal) -> AttnResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return signal_group(pid, signal);
        }

        let _ = signal;
        let mut killer = self.killer.lock().map_err(|_| poisoned("killer"))?;
        killer.kill().or_else(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput => Ok(()),
            _ => Err(AttnError::Io(e)),
        })
    }

    fn wait(&self) -> AttnResult<Option<i32>> {
        let mut child = self.child.lock().map_err(|_| poisoned("child"))?;
        let status = child.wait()?;
        Ok(i32::try_from(status.exit_code()).ok())
    }
}

/// Signal the whole process group; the PTY child leads its own session.
#[cfg(unix)]
fn signal_group(pid: u32, signal: KillSignal) -> AttnResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        KillSignal::Term => Signal::SIGTERM,
        KillSignal::Int => Signal::SIGINT,
        KillSignal::Hup => Signal::SIGHUP,
        KillSignal::Kill => Signal::SIGKILL,
    };
    let pid = i32::try_from(pid).map_err(|_| AttnError::Other(format!("invalid pid {pid}")))?;
    match killpg(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AttnError::Io(std::io::Error::from(e))),
    }
}

/// Resolve a possibly-relative working directory against the daemon's.
pub fn resolve_cwd(cwd: &str) -> PathBuf {
    let path = Path::new(cwd);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|d| d.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
