//! Session management: PTY lifecycle, replay buffer, output classification.

pub mod chunker;
pub mod classifier;
pub mod live;
pub mod manager;
pub mod pty;
pub mod recording;
pub mod ring_buffer;

#[cfg(test)]
pub(crate) mod testing;

pub use live::{AttachHandle, AttachOutcome, ClientId, ExitState, Session, SessionOptions};
pub use manager::{ManagerConfig, SessionManager};
pub use pty::{AgentExecutables, KillSignal, NativeSpawner, PtyProcess, PtySpawner, SpawnSpec};
pub use recording::{RecordingEntry, RecordingEvent, SessionRecorder};
pub use ring_buffer::{Capacity, RingBuffer};
