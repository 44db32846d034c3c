//! In-memory PTY processes for tests.

use super::pty::{KillSignal, PtyProcess, PtySpawner, SpawnSpec};
use attn_core::{AttnError, AttnResult};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Test-side control over one fake process.
pub struct FakeControl {
    pub pid: u32,
    output_tx: Mutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    input: Mutex<Vec<u8>>,
    signals: Mutex<Vec<KillSignal>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    exit: Mutex<Option<Option<i32>>>,
    exited: Condvar,
    /// Only SIGKILL terminates the process.
    ignore_term: AtomicBool,
    released: AtomicUsize,
}

impl FakeControl {
    fn new(pid: u32) -> (Arc<Self>, std_mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = std_mpsc::channel();
        let control = Arc::new(Self {
            pid,
            output_tx: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            exit: Mutex::new(None),
            exited: Condvar::new(),
            ignore_term: AtomicBool::new(false),
            released: AtomicUsize::new(0),
        });
        (control, rx)
    }

    /// Produce one read on the PTY output.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Close the output and let `wait` return `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.output_tx.lock().unwrap().take();
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(code);
        }
        self.exited.notify_all();
    }

    pub fn ignore_term(&self) {
        self.ignore_term.store(true, Ordering::SeqCst);
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<KillSignal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    /// How many times the process handle was dropped.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Poll until `input()` holds at least `len` bytes.
    pub async fn wait_for_input(&self, len: usize) -> Vec<u8> {
        for _ in 0..200 {
            let input = self.input();
            if input.len() >= len {
                return input;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.input()
    }
}

struct FakeReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    control: Arc<FakeControl>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.control.input.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct FakeProcess {
    control: Arc<FakeControl>,
    reader: Mutex<Option<FakeReader>>,
    writer_taken: AtomicBool,
}

impl FakeProcess {
    pub fn new(pid: u32) -> (Self, Arc<FakeControl>) {
        let (control, rx) = FakeControl::new(pid);
        let process = Self {
            control: control.clone(),
            reader: Mutex::new(Some(FakeReader {
                rx,
                pending: Vec::new(),
            })),
            writer_taken: AtomicBool::new(false),
        };
        (process, control)
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.control.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl PtyProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.control.pid)
    }

    fn take_reader(&self) -> AttnResult<Box<dyn Read + Send>> {
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AttnError::Other("reader taken".into()))?;
        Ok(Box::new(reader))
    }

    fn take_writer(&self) -> AttnResult<Box<dyn Write + Send>> {
        if self.writer_taken.swap(true, Ordering::SeqCst) {
            return Err(AttnError::Other("writer taken".into()));
        }
        Ok(Box::new(FakeWriter {
            control: self.control.clone(),
        }))
    }

    fn resize(&self, cols: u16, rows: u16) -> AttnResult<()> {
        self.control.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn signal(&self, signal: KillSignal) -> AttnResult<()> {
        self.control.signals.lock().unwrap().push(signal);
        if signal == KillSignal::Kill || !self.control.ignore_term.load(Ordering::SeqCst) {
            let code = match signal {
                KillSignal::Kill => 137,
                KillSignal::Int => 130,
                KillSignal::Hup => 129,
                KillSignal::Term => 143,
            };
            self.control.exit(Some(code));
        }
        Ok(())
    }

    fn wait(&self) -> AttnResult<Option<i32>> {
        let mut exit = self.control.exit.lock().unwrap();
        while exit.is_none() {
            exit = self.control.exited.wait(exit).unwrap();
        }
        Ok((*exit).flatten())
    }
}

/// Spawner handing out [`FakeProcess`]es and remembering their controls.
#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<Vec<(SpawnSpec, Arc<FakeControl>)>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following spawn fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    /// Control of the most recent process spawned for `id`.
    pub fn control(&self, id: &str) -> Arc<FakeControl> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(spec, _)| spec.id == id)
            .map(|(_, c)| c.clone())
            .unwrap_or_else(|| panic!("no process spawned for {id}"))
    }

    pub fn spec(&self, id: &str) -> SpawnSpec {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(spec, _)| spec.id == id)
            .map(|(s, _)| s.clone())
            .unwrap_or_else(|| panic!("no process spawned for {id}"))
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> AttnResult<Box<dyn PtyProcess>> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(AttnError::SpawnFailed(message));
        }
        let mut spawned = self.spawned.lock().unwrap();
        let (process, control) = FakeProcess::new(1000 + spawned.len() as u32);
        spawned.push((spec.clone(), control));
        Ok(Box::new(process))
    }
}

pub fn spec(id: &str) -> SpawnSpec {
    SpawnSpec {
        id: id.into(),
        agent: attn_core::AgentKind::Codex,
        cwd: std::env::temp_dir(),
        cols: 80,
        rows: 24,
        command: None,
        args: Vec::new(),
        env: Default::default(),
        label: None,
    }
}
