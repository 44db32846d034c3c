//! Session registry.
//!
//! Owns every live session, keyed by the client-chosen id. The registry
//! lock is only held to look up, reserve or remove entries; spawning,
//! signalling and PTY I/O all happen outside it.

use super::live::{AttachOutcome, ClientId, ExitState, Session, SessionOptions};
use super::pty::{KillSignal, PtySpawner, SpawnSpec};
use crate::state::SessionStateSink;
use attn_core::messages::SessionSummary;
use attn_core::{AgentState, AttnError, AttnResult};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry limits and per-session settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session: SessionOptions,
    pub max_sessions: usize,
    /// Grace period between a polite signal and SIGKILL.
    pub kill_timeout: Duration,
    /// Directory for debug capture files, if enabled.
    pub capture_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            max_sessions: 100,
            kill_timeout: Duration::from_secs(10),
            capture_dir: None,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Ids whose process is being spawned right now.
    spawning: HashSet<String>,
}

/// Manages all sessions.
pub struct SessionManager {
    inner: RwLock<Registry>,
    spawner: Arc<dyn PtySpawner>,
    state_sink: Arc<dyn SessionStateSink>,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        spawner: Arc<dyn PtySpawner>,
        state_sink: Arc<dyn SessionStateSink>,
    ) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            spawner,
            state_sink,
            config,
        }
    }

    /// Spawn a session under `spec.id`.
    ///
    /// Fails if a live session already uses the id. An exited session with
    /// the same id is replaced. Nothing is registered when the spawn fails.
    pub async fn spawn(&self, spec: SpawnSpec) -> AttnResult<Arc<Session>> {
        if spec.id.is_empty() {
            return Err(AttnError::InvalidMessage("session id is required".into()));
        }

        {
            let mut reg = self.inner.write().await;
            if reg.spawning.contains(&spec.id) {
                return Err(AttnError::SessionExists(spec.id));
            }
            if let Some(existing) = reg.sessions.get(&spec.id) {
                if existing.is_running() {
                    return Err(AttnError::SessionExists(spec.id));
                }
                debug!(session_id = %spec.id, "replacing exited session");
                reg.sessions.remove(&spec.id);
            }
            if reg.sessions.len() + reg.spawning.len() >= self.config.max_sessions {
                return Err(AttnError::Other(format!(
                    "max sessions ({}) reached",
                    self.config.max_sessions
                )));
            }
            reg.spawning.insert(spec.id.clone());
        }

        let started = self.start(&spec).await;

        let mut reg = self.inner.write().await;
        reg.spawning.remove(&spec.id);
        let session = started?;
        reg.sessions.insert(spec.id.clone(), session.clone());
        info!(
            session_id = %spec.id,
            agent = %spec.agent,
            pid = ?session.pid(),
            total = reg.sessions.len(),
            "session created"
        );
        Ok(session)
    }

    async fn start(&self, spec: &SpawnSpec) -> AttnResult<Arc<Session>> {
        let spawner = self.spawner.clone();
        let blocking_spec = spec.clone();
        let process = tokio::task::spawn_blocking(move || spawner.spawn(&blocking_spec))
            .await
            .map_err(|e| AttnError::SpawnFailed(format!("spawn task failed: {e}")))??;
        Session::start(
            spec,
            process,
            self.config.session,
            self.state_sink.clone(),
            self.config.capture_dir.as_deref(),
        )
    }

    /// Look up a session.
    pub async fn get(&self, id: &str) -> AttnResult<Arc<Session>> {
        self.inner
            .read()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| AttnError::SessionNotFound(id.to_string()))
    }

    pub async fn attach(
        &self,
        id: &str,
        client_id: ClientId,
        last_seq: Option<u64>,
    ) -> AttnResult<AttachOutcome> {
        Ok(self.get(id).await?.attach(client_id, last_seq))
    }

    /// Detach `client_id` from `id`. Unknown sessions and clients that are
    /// not attached are not errors.
    pub async fn detach(&self, id: &str, client_id: ClientId) -> bool {
        match self.get(id).await {
            Ok(session) => session.detach(client_id),
            Err(_) => false,
        }
    }

    pub async fn input(&self, id: &str, data: &[u8]) -> AttnResult<()> {
        self.get(id).await?.input(data)
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> AttnResult<()> {
        self.get(id).await?.resize(cols, rows)
    }

    /// Signal a session, escalating to SIGKILL after the kill timeout.
    ///
    /// Returns the session when the signal reached a live process, `None`
    /// when it had already exited (a no-op).
    pub async fn kill(&self, id: &str, signal: KillSignal) -> AttnResult<Option<Arc<Session>>> {
        let session = self.get(id).await?;
        let signalled = session.kill(signal, self.config.kill_timeout)?;
        Ok(signalled.then_some(session))
    }

    /// Report an externally observed agent state for a session.
    pub async fn report_state(&self, id: &str, state: AgentState) -> AttnResult<()> {
        let session = self.get(id).await?;
        self.state_sink.set_session_state(session.id(), state);
        Ok(())
    }

    /// Summaries of all sessions, ordered by id.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.inner.read().await.sessions.values().cloned().collect();
        let mut out: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Remove sessions that exited more than `grace` ago.
    ///
    /// Returns the ids that were removed.
    pub async fn gc(&self, grace: Duration) -> Vec<String> {
        let mut reg = self.inner.write().await;
        let mut removed = Vec::new();

        reg.sessions.retain(|id, session| {
            match session.exited_for() {
                Some(elapsed) if elapsed >= grace && session.attachment_count() == 0 => {
                    info!(session_id = %id, exit_code = ?session.exit_code(), "exited session removed");
                    removed.push(id.clone());
                    false
                }
                _ => true,
            }
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed sessions");
        }
        removed
    }

    /// Signal every running session and wait up to the kill timeout (plus a
    /// moment for SIGKILL) for them to exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.read().await.sessions.values().cloned().collect();
        let mut waits = Vec::new();
        for session in sessions.into_iter().filter(|s| s.is_running()) {
            match session.kill(KillSignal::Term, self.config.kill_timeout) {
                Ok(true) => waits.push(session.exit_watch()),
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "failed to signal session"),
            }
        }
        if waits.is_empty() {
            return;
        }

        info!(count = waits.len(), "waiting for sessions to exit");
        let deadline = self.config.kill_timeout + Duration::from_secs(2);
        let all = async {
            for mut rx in waits {
                let _ = rx.wait_for(ExitState::is_exited).await;
            }
        };
        if tokio::time::timeout(deadline, all).await.is_err() {
            warn!("some sessions did not exit before shutdown");
        }
    }

    #[cfg(test)]
    async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{spec, FakeSpawner};
    use super::*;
    use crate::state::StateBroadcaster;
    use attn_core::{Event, Lifecycle};

    fn manager(spawner: Arc<FakeSpawner>, max_sessions: usize) -> SessionManager {
        let config = ManagerConfig {
            max_sessions,
            kill_timeout: Duration::from_millis(200),
            ..ManagerConfig::default()
        };
        SessionManager::new(config, spawner, Arc::new(StateBroadcaster::new(16)))
    }

    async fn wait_exited(session: &Session) {
        tokio::time::timeout(Duration::from_secs(2), session.exit_watch().wait_for(ExitState::is_exited))
            .await
            .expect("session did not exit")
            .unwrap();
    }

    #[tokio::test]
    async fn spawn_and_list() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        mgr.spawn(spec("b")).await.unwrap();
        mgr.spawn(spec("a")).await.unwrap();

        let list = mgr.list().await;
        assert_eq!(list.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(list.iter().all(|s| s.lifecycle == Lifecycle::Running));
        assert_eq!(mgr.count().await, 2);
    }

    #[tokio::test]
    async fn duplicate_live_id_is_rejected() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        mgr.spawn(spec("s1")).await.unwrap();
        let err = mgr.spawn(spec("s1")).await.err().unwrap();
        assert!(matches!(err, AttnError::SessionExists(_)));
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn exited_id_can_be_reused() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        let first = mgr.spawn(spec("s1")).await.unwrap();
        spawner.control("s1").exit(Some(0));
        wait_exited(&first).await;

        let second = mgr.spawn(spec("s1")).await.unwrap();
        assert!(second.is_running());
        assert_eq!(mgr.count().await, 1);
    }

    #[tokio::test]
    async fn failed_spawn_registers_nothing() {
        let spawner = FakeSpawner::new();
        spawner.fail_with("no such file");
        let mgr = manager(spawner.clone(), 10);
        let err = mgr.spawn(spec("s1")).await.err().unwrap();
        assert!(matches!(err, AttnError::SpawnFailed(_)));
        assert_eq!(mgr.count().await, 0);
        assert!(matches!(mgr.get("s1").await, Err(AttnError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn max_sessions_is_enforced() {
        let mgr = manager(FakeSpawner::new(), 1);
        mgr.spawn(spec("a")).await.unwrap();
        assert!(mgr.spawn(spec("b")).await.is_err());
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let mgr = manager(FakeSpawner::new(), 1);
        assert!(matches!(
            mgr.spawn(spec("")).await,
            Err(AttnError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn unknown_session_operations() {
        let mgr = manager(FakeSpawner::new(), 1);
        assert!(matches!(mgr.input("nope", b"x").await, Err(AttnError::SessionNotFound(_))));
        assert!(matches!(mgr.resize("nope", 80, 24).await, Err(AttnError::SessionNotFound(_))));
        assert!(matches!(mgr.kill("nope", KillSignal::Term).await, Err(AttnError::SessionNotFound(_))));
        assert!(matches!(mgr.attach("nope", 1, None).await, Err(AttnError::SessionNotFound(_))));
        assert!(!mgr.detach("nope", 1).await);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        let session = mgr.spawn(spec("s1")).await.unwrap();
        assert!(mgr.kill("s1", KillSignal::Term).await.unwrap().is_some());
        wait_exited(&session).await;
        assert!(mgr.kill("s1", KillSignal::Term).await.unwrap().is_none());
        assert_eq!(spawner.control("s1").signals(), vec![KillSignal::Term]);
        assert_eq!(spawner.control("s1").released(), 1);
    }

    #[tokio::test]
    async fn gc_removes_only_expired_exits() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        let gone = mgr.spawn(spec("gone")).await.unwrap();
        mgr.spawn(spec("alive")).await.unwrap();
        spawner.control("gone").exit(Some(1));
        wait_exited(&gone).await;

        assert!(mgr.gc(Duration::from_secs(300)).await.is_empty());
        assert_eq!(mgr.gc(Duration::ZERO).await, vec!["gone".to_string()]);
        assert_eq!(mgr.count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_terminates_all() {
        let spawner = FakeSpawner::new();
        let mgr = manager(spawner.clone(), 10);
        let a = mgr.spawn(spec("a")).await.unwrap();
        let b = mgr.spawn(spec("b")).await.unwrap();
        spawner.control("b").ignore_term();

        mgr.shutdown().await;
        assert!(!a.is_running());
        assert!(!b.is_running());
        assert_eq!(spawner.control("b").signals(), vec![KillSignal::Term, KillSignal::Kill]);
    }

    #[tokio::test]
    async fn reported_state_is_broadcast() {
        let states = Arc::new(StateBroadcaster::new(16));
        let mut rx = states.subscribe();
        let mgr = SessionManager::new(ManagerConfig::default(), FakeSpawner::new(), states);
        mgr.spawn(spec("s1")).await.unwrap();

        mgr.report_state("s1", AgentState::Idle).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::SessionState(p) => assert_eq!((p.id.as_str(), p.state), ("s1", AgentState::Idle)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(mgr.report_state("nope", AgentState::Idle).await.is_err());
    }
}
