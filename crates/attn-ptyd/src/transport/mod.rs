//! Client transports.

pub mod websocket;
