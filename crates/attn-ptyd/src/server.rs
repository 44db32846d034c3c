//! Protocol handler: accepts client connections and maps commands onto the
//! session registry.
//!
//! Each connection gets a bounded outbound queue. Attachments forward their
//! events into it from their own tasks, so a slow socket applies
//! backpressure to that client's attachments only, which the session then
//! drops with a `buffer_overflow` desync instead of stalling.

use crate::config::ServerConfig;
use crate::session::pty::resolve_cwd;
use crate::session::{
    AttachHandle, AttachOutcome, ClientId, ExitState, KillSignal, NativeSpawner, PtySpawner,
    Session, SessionManager, SpawnSpec,
};
use crate::state::StateBroadcaster;
use crate::transport::websocket::{self, WebSocketConnection};
use attn_core::messages::{
    AttachResultPayload, SessionExitedPayload, SessionListPayload, SpawnResultPayload,
    SpawnSessionPayload,
};
use attn_core::{
    decode_command, encode_event, AgentKind, AttnError, AttnResult, Command, DesyncReason, Event,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Per-connection state threaded through the dispatch loop.
struct ConnectionContext {
    client_id: ClientId,
    /// Everything this connection sends goes through here.
    outbound: mpsc::Sender<Event>,
    /// Forwarder task per attached session.
    attachments: HashMap<String, JoinHandle<()>>,
    /// Pending `session_exited` notifications for sessions this client killed.
    exit_watchers: HashMap<String, JoinHandle<()>>,
}

/// The PTY daemon.
pub struct PtyServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    states: Arc<StateBroadcaster>,
    next_client_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl PtyServer {
    /// Create a daemon that spawns real PTY processes.
    pub fn new(config: ServerConfig) -> Self {
        let spawner = Arc::new(NativeSpawner::new(config.agents.clone()));
        Self::with_spawner(config, spawner)
    }

    pub fn with_spawner(config: ServerConfig, spawner: Arc<dyn PtySpawner>) -> Self {
        let states = Arc::new(StateBroadcaster::new(256));
        let sessions = Arc::new(SessionManager::new(
            config.manager_config(),
            spawner,
            states.clone(),
        ));
        Self {
            config,
            sessions,
            states,
            next_client_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and start accepting connections and collecting
    /// exited sessions in the background. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> AttnResult<SocketAddr> {
        let (addr, mut ws_rx) = websocket::start_listener(self.config.listen).await?;

        let gc_sessions = self.sessions.clone();
        let gc_interval = self.config.gc_interval;
        let exit_grace = self.config.exit_grace;
        let mut gc_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gc_sessions.gc(exit_grace).await;
                    }
                    _ = gc_shutdown.recv() => break,
                }
            }
        });

        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ws_conn) = ws_rx.recv() => {
                        let srv = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = srv.handle_websocket(ws_conn).await {
                                warn!(error = %e, "WebSocket connection error");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("accept loop stopped");
                        break;
                    }
                }
            }
        });

        info!(
            addr = %addr,
            max_sessions = self.config.max_sessions,
            scrollback_bytes = self.config.capacity.max_bytes,
            "attn-ptyd ready"
        );
        Ok(addr)
    }

    /// Stop accepting, close client connections and terminate every session.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(());
        self.sessions.shutdown().await;
    }

    fn connect(&self) -> (ConnectionContext, mpsc::Receiver<Event>) {
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let ctx = ConnectionContext {
            client_id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            outbound,
            attachments: HashMap::new(),
            exit_watchers: HashMap::new(),
        };
        (ctx, outbound_rx)
    }

    async fn disconnect(&self, ctx: ConnectionContext) {
        for (session_id, task) in ctx.attachments {
            self.sessions.detach(&session_id, ctx.client_id).await;
            task.abort();
        }
        for task in ctx.exit_watchers.into_values() {
            task.abort();
        }
        info!(client_id = ctx.client_id, "client disconnected");
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> AttnResult<()> {
        let (mut ctx, mut outbound_rx) = self.connect();
        let mut states_rx = self.states.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(client_id = ctx.client_id, remote = %conn.remote_addr, "client connected");

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(client_id = ctx.client_id, "closing connection for shutdown");
                    let _ = conn.ws_stream.close(None).await;
                    break Ok(());
                }

                Some(event) = outbound_rx.recv() => {
                    if let Err(e) = send_event(&mut conn.ws_stream, &event).await {
                        break Err(e);
                    }
                }

                state = states_rx.recv() => match state {
                    Ok(event) => {
                        if let Err(e) = send_event(&mut conn.ws_stream, &event).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(client_id = ctx.client_id, skipped, "state events dropped for slow client");
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },

                received = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match received {
                        Ok(Some(text)) => {
                            if let Some(reply) = self.handle_text(&mut ctx, &text).await {
                                if let Err(e) = send_event(&mut conn.ws_stream, &reply).await {
                                    break Err(e);
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(client_id = ctx.client_id, "WebSocket closed by peer");
                            break Ok(());
                        }
                        Err(e) => {
                            debug!(client_id = ctx.client_id, error = %e, "WebSocket ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.disconnect(ctx).await;
        result
    }

    async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) -> Option<Event> {
        match decode_command(text) {
            Ok(cmd) => self.dispatch(ctx, cmd).await,
            Err(rejected) => {
                debug!(client_id = ctx.client_id, cmd = %rejected.cmd, error = %rejected.error, "command rejected");
                Some(Event::command_error(rejected.cmd, rejected.error.to_string()))
            }
        }
    }

    /// Handle one decoded command. Returns the direct reply, if any; other
    /// events reach the client through its outbound queue.
    async fn dispatch(&self, ctx: &mut ConnectionContext, cmd: Command) -> Option<Event> {
        let name = cmd.name();
        match cmd {
            Command::SpawnSession(p) => Some(self.spawn(p).await),

            Command::AttachSession(p) => {
                if let Some(previous) = ctx.attachments.remove(&p.id) {
                    previous.abort();
                }
                match self.sessions.attach(&p.id, ctx.client_id, p.last_seq).await {
                    Ok(AttachOutcome::Attached(handle)) => {
                        info!(session_id = %p.id, client_id = ctx.client_id, last_seq = ?p.last_seq, "client attached");
                        let task = spawn_forwarder(handle, ctx.outbound.clone());
                        ctx.attachments.insert(p.id, task);
                        None
                    }
                    Ok(AttachOutcome::Desync) => {
                        info!(session_id = %p.id, client_id = ctx.client_id, last_seq = ?p.last_seq, "attach desync");
                        Some(Event::desync(p.id, DesyncReason::ReplayWindowExceeded))
                    }
                    Err(e) => {
                        debug!(session_id = %p.id, error = %e, "attach failed");
                        Some(Event::AttachResult(AttachResultPayload::failed(p.id, e.to_string())))
                    }
                }
            }

            Command::DetachSession(p) => {
                self.detach(ctx, &p.id).await;
                None
            }

            Command::PtyInput(p) => {
                if let Err(e) = self.sessions.input(&p.id, p.data.as_bytes()).await {
                    log_failure(name, &p.id, &e);
                }
                None
            }

            Command::PtyResize(p) => {
                if let Err(e) = self.sessions.resize(&p.id, p.cols, p.rows).await {
                    log_failure(name, &p.id, &e);
                }
                None
            }

            Command::KillSession(p) => {
                let signal = KillSignal::parse(p.signal.as_deref());
                self.detach(ctx, &p.id).await;
                match self.sessions.kill(&p.id, signal).await {
                    Ok(Some(session)) => {
                        let watching = ctx
                            .exit_watchers
                            .get(&p.id)
                            .is_some_and(|task| !task.is_finished());
                        if !watching {
                            // The requester is detached now; tell it about
                            // the exit directly, once.
                            let task = spawn_exit_notifier(&session, ctx.outbound.clone());
                            ctx.exit_watchers.insert(p.id, task);
                        }
                    }
                    Ok(None) => debug!(session_id = %p.id, "kill on exited session"),
                    Err(e) => log_failure(name, &p.id, &e),
                }
                None
            }

            Command::ListSessions => Some(Event::SessionList(SessionListPayload {
                sessions: self.sessions.list().await,
            })),

            Command::SetSessionState(p) => match self.sessions.report_state(&p.id, p.state).await {
                Ok(()) => None,
                Err(e) => Some(Event::command_error(name, e.to_string())),
            },
        }
    }

    async fn spawn(&self, p: SpawnSessionPayload) -> Event {
        let id = p.id.clone();
        let result = match spawn_spec(p) {
            Ok(spec) => self.sessions.spawn(spec).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(session) => Event::SpawnResult(SpawnResultPayload {
                id,
                success: true,
                pid: session.pid(),
                error: None,
            }),
            Err(e) => {
                warn!(session_id = %id, error = %e, "spawn failed");
                Event::SpawnResult(SpawnResultPayload {
                    id,
                    success: false,
                    pid: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn detach(&self, ctx: &mut ConnectionContext, session_id: &str) {
        if self.sessions.detach(session_id, ctx.client_id).await {
            info!(session_id, client_id = ctx.client_id, "client detached");
        }
        if let Some(task) = ctx.attachments.remove(session_id) {
            task.abort();
        }
    }
}

/// Validate a spawn request and fill in defaults.
fn spawn_spec(p: SpawnSessionPayload) -> AttnResult<SpawnSpec> {
    if p.id.trim().is_empty() {
        return Err(AttnError::InvalidMessage("session id is required".into()));
    }
    if p.cwd.trim().is_empty() {
        return Err(AttnError::InvalidMessage("cwd is required".into()));
    }
    Ok(SpawnSpec {
        agent: AgentKind::normalize(p.agent.as_deref()),
        cwd: resolve_cwd(p.cwd.trim()),
        cols: if p.cols == 0 { DEFAULT_COLS } else { p.cols },
        rows: if p.rows == 0 { DEFAULT_ROWS } else { p.rows },
        command: p.command.filter(|c| !c.trim().is_empty()),
        args: p.args,
        env: p.env,
        label: p.label,
        id: p.id,
    })
}

/// Move one attachment's events into the connection's outbound queue.
fn spawn_forwarder(mut handle: AttachHandle, outbound: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handle.events.recv().await {
            if outbound.send(event).await.is_err() {
                return;
            }
        }
        if handle.overflowed() {
            info!(session_id = %handle.session_id, client_id = handle.client_id, "attachment dropped, sending desync");
            let _ = outbound
                .send(Event::desync(handle.session_id.clone(), DesyncReason::BufferOverflow))
                .await;
        }
    })
}

/// Send `session_exited` to one client when `session` exits.
fn spawn_exit_notifier(session: &Session, outbound: mpsc::Sender<Event>) -> JoinHandle<()> {
    let mut exit_rx = session.exit_watch();
    let id = session.id().to_string();
    tokio::spawn(async move {
        let state = exit_rx.wait_for(ExitState::is_exited).await.map(|s| *s);
        if let Ok(ExitState::Exited(exit_code)) = state {
            let _ = outbound
                .send(Event::SessionExited(SessionExitedPayload { id, exit_code }))
                .await;
        }
    })
}

async fn send_event(ws: &mut WebSocketStream<TcpStream>, event: &Event) -> AttnResult<()> {
    let text = encode_event(event)?;
    websocket::ws_send_text(ws, text).await
}

/// Fire-and-forget commands only log their failures.
fn log_failure(cmd: &str, session_id: &str, e: &AttnError) {
    if e.is_soft() {
        debug!(cmd, session_id, error = %e, "command ignored");
    } else {
        warn!(cmd, session_id, error = %e, "command failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeSpawner;
    use crate::session::Capacity;
    use attn_core::{decode_event, encode_command, AgentState};
    use attn_core::messages::{
        AttachSessionPayload, KillSessionPayload, PtyInputPayload, SessionIdPayload,
        SetSessionStatePayload,
    };
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    fn server_with(spawner: Arc<FakeSpawner>, tweak: impl FnOnce(&mut ServerConfig)) -> Arc<PtyServer> {
        let mut config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            kill_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        tweak(&mut config);
        Arc::new(PtyServer::with_spawner(config, spawner))
    }

    fn spawn_cmd(id: &str) -> Command {
        Command::SpawnSession(SpawnSessionPayload {
            id: id.into(),
            cwd: std::env::temp_dir().display().to_string(),
            cols: 0,
            rows: 0,
            agent: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            label: Some("work".into()),
        })
    }

    fn attach_cmd(id: &str, last_seq: Option<u64>) -> Command {
        Command::AttachSession(AttachSessionPayload {
            id: id.into(),
            last_seq,
        })
    }

    async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbound closed")
    }

    async fn wait_for_seq(server: &PtyServer, id: &str, seq: u64) {
        let session = server.sessions.get(id).await.unwrap();
        for _ in 0..200 {
            if session.last_seq() >= seq {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("seq {seq} never reached");
    }

    #[tokio::test]
    async fn spawn_reports_pid_and_applies_defaults() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, _rx) = server.connect();

        match server.dispatch(&mut ctx, spawn_cmd("s1")).await {
            Some(Event::SpawnResult(r)) => {
                assert!(r.success, "{r:?}");
                assert_eq!(r.pid, Some(1000));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let spec = spawner.spec("s1");
        assert_eq!((spec.cols, spec.rows), (80, 24));
        assert_eq!(spec.agent, AgentKind::Codex);
        assert_eq!(spec.label.as_deref(), Some("work"));

        match server.dispatch(&mut ctx, spawn_cmd("s1")).await {
            Some(Event::SpawnResult(r)) => {
                assert!(!r.success);
                assert!(r.error.unwrap().contains("already exists"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failures_leave_no_session() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, _rx) = server.connect();

        let mut no_cwd = spawn_cmd("s1");
        if let Command::SpawnSession(p) = &mut no_cwd {
            p.cwd = " ".into();
        }
        assert!(matches!(
            server.dispatch(&mut ctx, no_cwd).await,
            Some(Event::SpawnResult(SpawnResultPayload { success: false, .. }))
        ));

        spawner.fail_with("executable not found");
        match server.dispatch(&mut ctx, spawn_cmd("s1")).await {
            Some(Event::SpawnResult(r)) => {
                assert!(!r.success);
                assert!(r.error.unwrap().contains("executable not found"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(server.sessions.list().await.is_empty());
    }

    #[tokio::test]
    async fn attach_unknown_session_fails() {
        let server = server_with(FakeSpawner::new(), |_| {});
        let (mut ctx, _rx) = server.connect();
        match server.dispatch(&mut ctx, attach_cmd("nope", None)).await {
            Some(Event::AttachResult(r)) => {
                assert!(!r.success);
                assert!(r.error.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_streams_replay_then_output() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, mut rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        let control = spawner.control("s1");
        control.emit(b"$ ");
        wait_for_seq(&server, "s1", 1).await;

        assert!(server.dispatch(&mut ctx, attach_cmd("s1", None)).await.is_none());
        match recv(&mut rx).await {
            Event::AttachResult(r) => {
                assert!(r.success && r.running);
                assert_eq!(r.chunks.len(), 1);
                assert_eq!(r.last_seq, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        control.emit(b"ls\r\n");
        match recv(&mut rx).await {
            Event::PtyOutput(p) => {
                assert_eq!(p.seq, 2);
                assert_eq!(p.data, b"ls\r\n");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn evicted_resume_point_replies_desync() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |c| c.capacity = Capacity::chunks(3));
        let (mut ctx, _rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        let control = spawner.control("s1");
        for i in 1..=5u64 {
            control.emit(b"x");
            wait_for_seq(&server, "s1", i).await;
        }
        match server.dispatch(&mut ctx, attach_cmd("s1", Some(2))).await {
            Some(Event::PtyDesync(d)) => assert_eq!(d.reason, DesyncReason::ReplayWindowExceeded),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_client_gets_overflow_desync() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |c| {
            c.attachment_queue = 2;
            c.outbound_queue = 1;
        });
        let (mut ctx, mut rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        server.dispatch(&mut ctx, attach_cmd("s1", None)).await;
        let control = spawner.control("s1");
        for i in 1..=8u64 {
            control.emit(format!("{i}").as_bytes());
            wait_for_seq(&server, "s1", i).await;
        }

        let mut seqs = Vec::new();
        loop {
            match recv(&mut rx).await {
                Event::AttachResult(_) => {}
                Event::PtyOutput(p) => seqs.push(p.seq),
                Event::PtyDesync(d) => {
                    assert_eq!(d.reason, DesyncReason::BufferOverflow);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "gap in {seqs:?}");
        assert!(server.sessions.get("s1").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn input_reaches_the_process() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, _rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;

        let input = Command::PtyInput(PtyInputPayload {
            id: "s1".into(),
            data: "héllo\r".into(),
        });
        assert!(server.dispatch(&mut ctx, input).await.is_none());
        assert_eq!(spawner.control("s1").wait_for_input(7).await, "héllo\r".as_bytes());

        // Unknown sessions are ignored without a reply.
        let stray = Command::PtyInput(PtyInputPayload {
            id: "nope".into(),
            data: "x".into(),
        });
        assert!(server.dispatch(&mut ctx, stray).await.is_none());
    }

    #[tokio::test]
    async fn kill_notifies_requester_once() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, mut rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        server.dispatch(&mut ctx, attach_cmd("s1", None)).await;
        assert!(matches!(recv(&mut rx).await, Event::AttachResult(_)));

        let kill = Command::KillSession(KillSessionPayload {
            id: "s1".into(),
            signal: None,
        });
        assert!(server.dispatch(&mut ctx, kill).await.is_none());
        match recv(&mut rx).await {
            Event::SessionExited(e) => {
                assert_eq!(e.id, "s1");
                assert_eq!(e.exit_code, Some(143));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(spawner.control("s1").signals(), vec![KillSignal::Term]);

        match server.dispatch(&mut ctx, Command::ListSessions).await {
            Some(Event::SessionList(list)) => {
                assert_eq!(list.sessions.len(), 1);
                assert_eq!(list.sessions[0].lifecycle, attn_core::Lifecycle::Exited);
                assert_eq!(list.sessions[0].attachments, 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_kills_report_exit_once() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, mut rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        let control = spawner.control("s1");
        control.ignore_term();

        let kill = || {
            Command::KillSession(KillSessionPayload {
                id: "s1".into(),
                signal: None,
            })
        };
        server.dispatch(&mut ctx, kill()).await;
        server.dispatch(&mut ctx, kill()).await;

        // TERM is ignored, so the exit comes from the SIGKILL escalation.
        match recv(&mut rx).await {
            Event::SessionExited(e) => assert_eq!(e.exit_code, Some(137)),
            other => panic!("unexpected event {other:?}"),
        }
        server.dispatch(&mut ctx, kill()).await;

        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        assert_eq!(control.released(), 1);
    }

    #[tokio::test]
    async fn disconnect_detaches_without_killing() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, _rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        server.dispatch(&mut ctx, attach_cmd("s1", None)).await;
        let session = server.sessions.get("s1").await.unwrap();
        assert_eq!(session.attachment_count(), 1);

        server.disconnect(ctx).await;
        assert_eq!(session.attachment_count(), 0);
        assert!(session.is_running());
        assert!(spawner.control("s1").signals().is_empty());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let (mut ctx, _rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;
        server.dispatch(&mut ctx, attach_cmd("s1", None)).await;
        for _ in 0..2 {
            let detach = Command::DetachSession(SessionIdPayload { id: "s1".into() });
            assert!(server.dispatch(&mut ctx, detach).await.is_none());
        }
        assert_eq!(server.sessions.get("s1").await.unwrap().attachment_count(), 0);
    }

    #[tokio::test]
    async fn malformed_commands_get_command_error() {
        let server = server_with(FakeSpawner::new(), |_| {});
        let (mut ctx, _rx) = server.connect();

        match server.handle_text(&mut ctx, "{not json").await {
            Some(Event::CommandError(e)) => assert_eq!(e.cmd, "unknown"),
            other => panic!("unexpected reply {other:?}"),
        }
        match server.handle_text(&mut ctx, r#"{"cmd":"reboot"}"#).await {
            Some(Event::CommandError(e)) => {
                assert_eq!(e.cmd, "reboot");
                assert!(e.error.contains("unsupported"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        match server.handle_text(&mut ctx, r#"{"cmd":"pty_resize","id":"s1"}"#).await {
            Some(Event::CommandError(e)) => assert_eq!(e.cmd, "pty_resize"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn reported_state_reaches_subscribers() {
        let server = server_with(FakeSpawner::new(), |_| {});
        let mut states = server.states.subscribe();
        let (mut ctx, _rx) = server.connect();
        server.dispatch(&mut ctx, spawn_cmd("s1")).await;

        let set = |id: &str| {
            Command::SetSessionState(SetSessionStatePayload {
                id: id.into(),
                state: AgentState::WaitingInput,
            })
        };
        assert!(server.dispatch(&mut ctx, set("s1")).await.is_none());
        match states.recv().await.unwrap() {
            Event::SessionState(s) => assert_eq!(s.state, AgentState::WaitingInput),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            server.dispatch(&mut ctx, set("nope")).await,
            Some(Event::CommandError(_))
        ));
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        let spawner = FakeSpawner::new();
        let server = server_with(spawner.clone(), |_| {});
        let addr = server.start().await.unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();

        async fn next_event<S>(ws: &mut S) -> Event
        where
            S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
        {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                    .await
                    .expect("timed out")
                    .expect("closed")
                    .expect("ws error");
                if let Message::Text(text) = msg {
                    return decode_event(text.as_str()).unwrap();
                }
            }
        }

        let spawn = encode_command(&spawn_cmd("s1")).unwrap();
        ws.send(Message::Text(spawn.into())).await.unwrap();
        assert!(matches!(next_event(&mut ws).await, Event::SpawnResult(r) if r.success));

        let attach = encode_command(&attach_cmd("s1", None)).unwrap();
        ws.send(Message::Text(attach.into())).await.unwrap();
        assert!(matches!(next_event(&mut ws).await, Event::AttachResult(r) if r.success));

        spawner.control("s1").emit(b"\x1b[32mready\x1b[0m");
        match next_event(&mut ws).await {
            Event::PtyOutput(p) => assert_eq!(p.data, b"\x1b[32mready\x1b[0m"),
            other => panic!("unexpected event {other:?}"),
        }

        ws.send(Message::Text("garbage".to_string().into())).await.unwrap();
        assert!(matches!(next_event(&mut ws).await, Event::CommandError(_)));

        drop(ws);
        let session = server.sessions.get("s1").await.unwrap();
        for _ in 0..200 {
            if session.attachment_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.attachment_count(), 0);
        assert!(session.is_running());

        server.shutdown().await;
        assert!(!session.is_running());
    }
}
