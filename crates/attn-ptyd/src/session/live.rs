//! A live PTY session and its attachments.
//!
//! One blocking reader loop per session turns PTY reads into sequenced
//! chunks. Appending a chunk to the replay buffer and fanning it out to the
//! attachments happens under the same lock as attaching, so a client that
//! attaches sees every chunk either in its replay or as live output, never
//! both and never neither.

use super::chunker::Chunker;
use super::classifier::StateClassifier;
use super::pty::{KillSignal, PtyProcess, SpawnSpec};
use super::recording::{RecordingEvent, SessionRecorder};
use super::ring_buffer::{Capacity, RingBuffer};
use crate::state::SessionStateSink;
use attn_core::messages::{
    AttachResultPayload, PtyOutputPayload, SessionExitedPayload, SessionSummary,
};
use attn_core::{AgentKind, AttnError, AttnResult, Event, Lifecycle};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Identifies one client connection.
pub type ClientId = u64;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Per-session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub capacity: Capacity,
    /// Events an attachment may have in flight before it is dropped.
    pub attachment_queue: usize,
    /// Bytes the chunker may withhold waiting for a sequence to end.
    pub max_withhold: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capacity: Capacity::bytes(8 * 1024 * 1024),
            attachment_queue: 256,
            max_withhold: super::chunker::DEFAULT_MAX_WITHHOLD,
        }
    }
}

/// Whether the process has exited, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited(Option<i32>),
}

impl ExitState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ExitState::Exited(_))
    }
}

struct Attachment {
    tx: mpsc::Sender<Event>,
    last_delivered: u64,
    overflowed: Arc<AtomicBool>,
}

struct Shared {
    lifecycle: Lifecycle,
    exit_code: Option<i32>,
    exited_at: Option<Instant>,
    attachments: HashMap<ClientId, Attachment>,
}

/// Events for one client's view of one session.
///
/// The first event is always the `attach_result`. The stream ends when the
/// client detaches, the session exits, or the client falls too far behind;
/// [`AttachHandle::overflowed`] tells the last case apart.
pub struct AttachHandle {
    pub session_id: String,
    pub client_id: ClientId,
    pub events: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
}

impl AttachHandle {
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

pub enum AttachOutcome {
    Attached(AttachHandle),
    /// The requested resume point is no longer (or not yet) in the buffer.
    Desync,
}

pub struct Session {
    id: String,
    agent: AgentKind,
    cwd: String,
    label: Option<String>,
    pid: Option<u32>,
    size: Mutex<(u16, u16)>,
    buffer: RingBuffer,
    shared: Mutex<Shared>,
    /// Released exactly once, when the process has been reaped.
    process: Mutex<Option<Arc<dyn PtyProcess>>>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    exit_tx: watch::Sender<ExitState>,
    recorder: Option<SessionRecorder>,
    attachment_queue: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    /// Wrap a freshly spawned process and start its reader and writer
    /// loops. Must be called from within a tokio runtime.
    pub fn start(
        spec: &SpawnSpec,
        process: Box<dyn PtyProcess>,
        options: SessionOptions,
        state_sink: Arc<dyn SessionStateSink>,
        capture_dir: Option<&Path>,
    ) -> AttnResult<Arc<Self>> {
        let process: Arc<dyn PtyProcess> = Arc::from(process);
        let (reader, writer) = match process.take_reader().and_then(|r| Ok((r, process.take_writer()?))) {
            Ok(io) => io,
            Err(e) => {
                let _ = process.signal(KillSignal::Kill);
                return Err(e);
            }
        };

        let recorder = capture_dir.map(|dir| SessionRecorder::start(dir, &spec.id));
        if let Some(rec) = &recorder {
            rec.record(RecordingEvent::Start {
                agent: spec.agent.to_string(),
                cwd: spec.cwd.display().to_string(),
                cols: spec.cols,
                rows: spec.rows,
            });
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (exit_tx, _) = watch::channel(ExitState::Running);
        let session = Arc::new(Self {
            id: spec.id.clone(),
            agent: spec.agent,
            cwd: spec.cwd.display().to_string(),
            label: spec.label.clone(),
            pid: process.pid(),
            size: Mutex::new((spec.cols, spec.rows)),
            buffer: RingBuffer::new(options.capacity),
            shared: Mutex::new(Shared {
                lifecycle: Lifecycle::Spawning,
                exit_code: None,
                exited_at: None,
                attachments: HashMap::new(),
            }),
            process: Mutex::new(Some(process.clone())),
            input_tx: Mutex::new(Some(input_tx)),
            exit_tx,
            recorder,
            attachment_queue: options.attachment_queue.max(2),
        });

        lock(&session.shared).lifecycle = Lifecycle::Running;

        let id = spec.id.clone();
        tokio::task::spawn_blocking(move || write_loop(id, writer, input_rx));

        let reader_session = session.clone();
        let chunker = Chunker::new(options.max_withhold);
        let classifier = StateClassifier::for_agent(spec.agent);
        tokio::task::spawn_blocking(move || {
            read_loop(reader_session, process, reader, chunker, classifier, state_sink)
        });
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> AgentKind {
        self.agent
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.shared).lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() != Lifecycle::Exited
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.shared).exit_code
    }

    /// Time since the process exited, if it has.
    pub fn exited_for(&self) -> Option<Duration> {
        lock(&self.shared).exited_at.map(|t| t.elapsed())
    }

    pub fn attachment_count(&self) -> usize {
        lock(&self.shared).attachments.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.buffer.last_seq()
    }

    /// Watch for process exit.
    pub fn exit_watch(&self) -> watch::Receiver<ExitState> {
        self.exit_tx.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        let (cols, rows) = self.size();
        let shared = lock(&self.shared);
        SessionSummary {
            id: self.id.clone(),
            agent: self.agent,
            cwd: self.cwd.clone(),
            label: self.label.clone(),
            pid: self.pid,
            lifecycle: shared.lifecycle,
            cols,
            rows,
            last_seq: self.buffer.last_seq(),
            attachments: shared.attachments.len(),
            exit_code: shared.exit_code,
        }
    }

    /// Attach `client_id`, replaying everything after `last_seq`.
    ///
    /// Re-attaching a client that is already attached replaces its previous
    /// attachment. An exited session answers with an unsuccessful result
    /// that still carries the retained output and exit code, followed by
    /// the exit event; no attachment is registered.
    pub fn attach(&self, client_id: ClientId, last_seq: Option<u64>) -> AttachOutcome {
        let since = last_seq.unwrap_or(0);
        let (cols, rows) = self.size();
        let mut shared = lock(&self.shared);

        let Some(snapshot) = self.buffer.snapshot_since(since) else {
            info!(
                session_id = %self.id,
                client_id,
                last_seq = since,
                first_seq = ?self.buffer.first_seq(),
                newest_seq = self.buffer.last_seq(),
                "resume point outside replay window"
            );
            return AttachOutcome::Desync;
        };

        let (tx, rx) = mpsc::channel(self.attachment_queue);
        let running = shared.lifecycle != Lifecycle::Exited;
        let replayed = snapshot.chunks.len();
        let newest = snapshot.last_seq;
        // Fresh channel with room for at least two events.
        let _ = tx.try_send(Event::AttachResult(AttachResultPayload {
            id: self.id.clone(),
            success: running,
            error: (!running).then(|| format!("session not running: {}", self.id)),
            chunks: snapshot.chunks,
            last_seq: newest,
            cols,
            rows,
            pid: self.pid,
            running,
            exit_code: shared.exit_code,
            truncated: snapshot.truncated,
        }));

        let overflowed = Arc::new(AtomicBool::new(false));
        if running {
            shared.attachments.insert(
                client_id,
                Attachment {
                    tx,
                    last_delivered: newest,
                    overflowed: overflowed.clone(),
                },
            );
        } else {
            let _ = tx.try_send(Event::SessionExited(SessionExitedPayload {
                id: self.id.clone(),
                exit_code: shared.exit_code,
            }));
        }
        debug!(session_id = %self.id, client_id, replayed, last_seq = newest, running, "client attached");

        AttachOutcome::Attached(AttachHandle {
            session_id: self.id.clone(),
            client_id,
            events: rx,
            overflowed,
        })
    }

    /// Remove `client_id`'s attachment. Returns whether one existed.
    pub fn detach(&self, client_id: ClientId) -> bool {
        let removed = lock(&self.shared).attachments.remove(&client_id);
        if let Some(att) = &removed {
            debug!(session_id = %self.id, client_id, last_delivered = att.last_delivered, "client detached");
        }
        removed.is_some()
    }

    /// Queue bytes for the PTY input, in order.
    pub fn input(&self, data: &[u8]) -> AttnResult<()> {
        if !self.is_running() {
            return Err(AttnError::SessionExited(self.id.clone()));
        }
        let sent = match lock(&self.input_tx).as_ref() {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        };
        if !sent {
            return Err(AttnError::SessionExited(self.id.clone()));
        }
        self.record(|| RecordingEvent::Input { bytes: data.len() });
        Ok(())
    }

    /// Resize the terminal. Zero dimensions are ignored.
    pub fn resize(&self, cols: u16, rows: u16) -> AttnResult<()> {
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        let process = lock(&self.process).clone();
        let Some(process) = process.filter(|_| self.is_running()) else {
            return Err(AttnError::SessionExited(self.id.clone()));
        };
        process.resize(cols, rows)?;
        *lock(&self.size) = (cols, rows);
        self.record(|| RecordingEvent::Resize { cols, rows });
        Ok(())
    }

    /// Send `signal` to the process group. Returns `false` when the process
    /// has already been reaped.
    pub fn signal(&self, signal: KillSignal) -> AttnResult<bool> {
        let process = lock(&self.process).clone();
        match process {
            Some(p) => {
                p.signal(signal)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Signal the process and escalate to SIGKILL if it has not exited
    /// within `timeout`. Does not wait for the exit itself. Returns `false`
    /// when the process had already been reaped.
    pub fn kill(self: &Arc<Self>, signal: KillSignal, timeout: Duration) -> AttnResult<bool> {
        if !self.signal(signal)? {
            debug!(session_id = %self.id, "kill on exited session ignored");
            return Ok(false);
        }
        info!(session_id = %self.id, ?signal, "session signalled");
        if signal == KillSignal::Kill {
            return Ok(true);
        }

        let session = self.clone();
        let mut exit_rx = self.exit_watch();
        tokio::spawn(async move {
            let exited = tokio::time::timeout(timeout, exit_rx.wait_for(ExitState::is_exited)).await;
            if exited.is_err() {
                warn!(session_id = %session.id, timeout_secs = timeout.as_secs(), "session ignored signal, sending SIGKILL");
                if let Err(e) = session.signal(KillSignal::Kill) {
                    warn!(session_id = %session.id, error = %e, "SIGKILL failed");
                }
            }
        });
        Ok(true)
    }

    fn record(&self, event: impl FnOnce() -> RecordingEvent) {
        if let Some(rec) = &self.recorder {
            rec.record(event());
        }
    }

    /// Sequence a chunk and deliver it to every attachment.
    fn publish(
        &self,
        data: Vec<u8>,
        classifier: Option<&mut StateClassifier>,
        state_sink: &dyn SessionStateSink,
    ) {
        let seq = {
            let mut shared = lock(&self.shared);
            let seq = self.buffer.append(data.clone());
            let event = Event::PtyOutput(PtyOutputPayload {
                id: self.id.clone(),
                seq,
                data: data.clone(),
            });
            let id = &self.id;
            shared.attachments.retain(|client_id, att| match att.tx.try_send(event.clone()) {
                Ok(()) => {
                    att.last_delivered = seq;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    att.overflowed.store(true, Ordering::Release);
                    warn!(session_id = %id, client_id, last_delivered = att.last_delivered, "client fell behind, detaching");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
            seq
        };

        if let Some(state) = classifier.and_then(|c| c.observe(&data)) {
            state_sink.set_session_state(&self.id, state);
            self.record(|| RecordingEvent::State { state });
        }
        self.record(|| RecordingEvent::output(seq, &data));
    }

    /// Mark the session exited and notify attachments. Runs once.
    fn finish(&self, exit_code: Option<i32>) {
        {
            let mut shared = lock(&self.shared);
            if shared.lifecycle == Lifecycle::Exited {
                return;
            }
            shared.lifecycle = Lifecycle::Exited;
            shared.exit_code = exit_code;
            shared.exited_at = Some(Instant::now());

            let event = Event::SessionExited(SessionExitedPayload {
                id: self.id.clone(),
                exit_code,
            });
            for (_, att) in shared.attachments.drain() {
                if let Err(TrySendError::Full(_)) = att.tx.try_send(event.clone()) {
                    att.overflowed.store(true, Ordering::Release);
                }
            }
        }

        lock(&self.input_tx).take();
        lock(&self.process).take();
        self.exit_tx.send_replace(ExitState::Exited(exit_code));
        self.record(|| RecordingEvent::Exit { code: exit_code });
        info!(session_id = %self.id, ?exit_code, last_seq = self.buffer.last_seq(), "session exited");
    }
}

fn read_loop(
    session: Arc<Session>,
    process: Arc<dyn PtyProcess>,
    mut reader: Box<dyn Read + Send>,
    mut chunker: Chunker,
    mut classifier: Option<StateClassifier>,
    state_sink: Arc<dyn SessionStateSink>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(chunk) = chunker.push(&buf[..n]) {
                    session.publish(chunk, classifier.as_mut(), state_sink.as_ref());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the slave side is closed.
                debug!(session_id = %session.id, error = %e, "PTY read ended");
                break;
            }
        }
    }
    if let Some(rest) = chunker.flush() {
        session.publish(rest, classifier.as_mut(), state_sink.as_ref());
    }
    drop(reader);

    let exit_code = match process.wait() {
        Ok(code) => code,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "failed to reap session process");
            None
        }
    };
    drop(process);
    session.finish(exit_code);
}

fn write_loop(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!(session_id = %session_id, error = %e, "PTY write failed");
            break;
        }
    }
}
