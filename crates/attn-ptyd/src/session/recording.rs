//! Debug capture of session traffic.
//!
//! When a capture directory is configured, every session writes a
//! newline-delimited JSON file of timestamped events (output chunks,
//! input sizes, resizes, classifier states, exit). Capture is best-effort:
//! write failures are logged and never slow down the session.

use attn_core::codec::base64_bytes;
use attn_core::AgentState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Output bytes kept per captured chunk.
const MAX_CAPTURED_OUTPUT: usize = 4096;

/// Event types that can appear in a capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordingEvent {
    /// Session started.
    Start {
        agent: String,
        cwd: String,
        cols: u16,
        rows: u16,
    },
    /// One sequenced output chunk, possibly cut short.
    Output {
        seq: u64,
        #[serde(rename = "data_b64", with = "base64_bytes")]
        data: Vec<u8>,
        /// Original chunk length when `data` was cut.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_len: Option<usize>,
    },
    /// Client input; only the size is kept.
    Input { bytes: usize },
    Resize { cols: u16, rows: u16 },
    /// Classifier decision.
    State { state: AgentState },
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
}

impl RecordingEvent {
    pub fn output(seq: u64, data: &[u8]) -> Self {
        if data.len() > MAX_CAPTURED_OUTPUT {
            RecordingEvent::Output {
                seq,
                data: data[..MAX_CAPTURED_OUTPUT].to_vec(),
                original_len: Some(data.len()),
            }
        } else {
            RecordingEvent::Output {
                seq,
                data: data.to_vec(),
                original_len: None,
            }
        }
    }
}

/// A single timestamped entry in the capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// Milliseconds since capture start.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub event: RecordingEvent,
}

/// Writes capture events for one session.
///
/// `record` never blocks: entries go through a channel to a writer task
/// that owns the file.
pub struct SessionRecorder {
    path: PathBuf,
    start_time: Instant,
    tx: mpsc::UnboundedSender<RecordingEntry>,
}

impl SessionRecorder {
    /// Start a recorder writing `<dir>/<session_id>.jsonl`. Must be called
    /// from within a tokio runtime.
    pub fn start(dir: &Path, session_id: &str) -> Self {
        let path = dir.join(format!("{}.jsonl", sanitize_file_name(session_id)));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        debug!(path = %path.display(), "capture started");
        Self {
            path,
            start_time: Instant::now(),
            tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Dropped silently once the writer has stopped.
    pub fn record(&self, event: RecordingEvent) {
        let entry = RecordingEntry {
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            event,
        };
        let _ = self.tx.send(entry);
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<RecordingEntry>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(path = %parent.display(), error = %e, "failed to create capture directory");
            return;
        }
    }
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to open capture file");
            return;
        }
    };

    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize capture event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(path = %path.display(), error = %e, "failed to write capture");
            return;
        }
        if let Err(e) = file.flush().await {
            debug!(path = %path.display(), error = %e, "failed to flush capture");
        }
    }
    debug!(path = %path.display(), "capture stopped");
}

fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Load a capture file, skipping malformed lines.
pub async fn load_recording(path: &Path) -> std::io::Result<Vec<RecordingEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordingEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed capture line");
            }
        }
    }
    Ok(entries)
}
