//! JSON text codec for the daemon's WebSocket protocol.
//!
//! Wire format: one JSON object per text message. Binary payloads are
//! standard base64 strings.

use crate::error::{AttnError, AttnResult};
use crate::messages::{
    Command, Event, CMD_ATTACH_SESSION, CMD_DETACH_SESSION, CMD_KILL_SESSION, CMD_LIST_SESSIONS,
    CMD_PTY_INPUT, CMD_PTY_RESIZE, CMD_SET_SESSION_STATE, CMD_SPAWN_SESSION,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const KNOWN_COMMANDS: &[&str] = &[
    CMD_SPAWN_SESSION,
    CMD_ATTACH_SESSION,
    CMD_DETACH_SESSION,
    CMD_PTY_INPUT,
    CMD_PTY_RESIZE,
    CMD_KILL_SESSION,
    CMD_LIST_SESSIONS,
    CMD_SET_SESSION_STATE,
];

/// A command that could not be decoded, with enough context to answer it.
#[derive(Debug)]
pub struct RejectedCommand {
    /// The `cmd` field if it could be read, otherwise `"unknown"`.
    pub cmd: String,
    pub error: AttnError,
}

/// Encode an event as a JSON text message.
pub fn encode_event(event: &Event) -> AttnResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event (client side and tests).
pub fn decode_event(text: &str) -> AttnResult<Event> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a command as a JSON text message (client side and tests).
pub fn encode_command(command: &Command) -> AttnResult<String> {
    Ok(serde_json::to_string(command)?)
}

/// Decode one inbound command.
///
/// Unknown command names and malformed payloads are both rejected; the
/// rejection carries the command name so the caller can reply with a
/// `command_error` naming it.
pub fn decode_command(text: &str) -> Result<Command, RejectedCommand> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| RejectedCommand {
        cmd: "unknown".into(),
        error: AttnError::InvalidMessage(format!("malformed JSON: {e}")),
    })?;

    let cmd = match value.get("cmd").and_then(|c| c.as_str()) {
        Some(name) => name.to_string(),
        None => {
            return Err(RejectedCommand {
                cmd: "unknown".into(),
                error: AttnError::InvalidMessage("missing cmd field".into()),
            })
        }
    };

    if !KNOWN_COMMANDS.contains(&cmd.as_str()) {
        return Err(RejectedCommand {
            cmd,
            error: AttnError::InvalidMessage("unsupported command".into()),
        });
    }

    serde_json::from_value::<Command>(value).map_err(|e| RejectedCommand {
        cmd,
        error: AttnError::InvalidMessage(e.to_string()),
    })
}

/// Encode raw bytes as standard base64.
pub fn encode_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode standard base64 into raw bytes.
pub fn decode_bytes(text: &str) -> AttnResult<Vec<u8>> {
    Ok(BASE64.decode(text)?)
}

/// `serde(with = ...)` adapter carrying `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use super::{decode_bytes, encode_bytes};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_bytes(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_bytes(&text).map_err(serde::de::Error::custom)
    }
}
