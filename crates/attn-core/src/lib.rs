//! attn-core: shared protocol library for the attn PTY daemon.
//!
//! Provides the JSON command/event types, the text codec with base64 byte
//! payloads, and the shared error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_command, decode_event, encode_command, encode_event, RejectedCommand};
pub use error::{AttnError, AttnResult};
pub use messages::{AgentKind, AgentState, Chunk, Command, DesyncReason, Event, Lifecycle};
