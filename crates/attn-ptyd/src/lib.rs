//! attn-ptyd: PTY session daemon.
//!
//! Owns the agent terminals, keeps a bounded replay window per session and
//! serves attached UI clients over a local WebSocket.

pub mod config;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{CliOverrides, ServerConfig};
pub use server::PtyServer;
