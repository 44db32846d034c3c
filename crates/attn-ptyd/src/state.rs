//! Agent attention state reporting.
//!
//! Classifier decisions and hook-reported states both end up here and are
//! fanned out to every connected client as `session_state` events.

use attn_core::messages::SessionStatePayload;
use attn_core::{AgentState, Event};
use tokio::sync::broadcast;
use tracing::debug;

/// Receives agent state changes for a session.
pub trait SessionStateSink: Send + Sync {
    fn set_session_state(&self, session_id: &str, state: AgentState);
}

/// Broadcasts state changes to all subscribed connections.
pub struct StateBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl StateBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl SessionStateSink for StateBroadcaster {
    fn set_session_state(&self, session_id: &str, state: AgentState) {
        debug!(session_id, state = %state, "session state changed");
        // No receivers simply means no client is connected.
        let _ = self.tx.send(Event::SessionState(SessionStatePayload {
            id: session_id.to_string(),
            state,
        }));
    }
}
