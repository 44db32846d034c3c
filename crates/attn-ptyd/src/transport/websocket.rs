//! WebSocket listener using tokio-tungstenite.
//!
//! The UI talks to the daemon over plain WebSocket on loopback. Every
//! protocol message is one JSON text frame.

use attn_core::{AttnError, AttnResult};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind and start accepting WebSocket connections.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields connections whose handshake completed.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> AttnResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AttnError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| AttnError::Transport(format!("WS local address: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("WebSocket listener stopped");
                return;
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one text message.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> AttnResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| AttnError::Transport(format!("WS send failed: {e}")))
}

/// Maximum inbound message size (1 MiB).
const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// Receive the next text message.
///
/// Returns `None` when the connection is closed. Binary frames are ignored.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> AttnResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_MESSAGE_SIZE {
                    return Err(AttnError::InvalidMessage(format!(
                        "WS message too large: {} bytes (max {})",
                        text.len(),
                        MAX_WS_MESSAGE_SIZE
                    )));
                }
                return Ok(Some(text.as_str().to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(AttnError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
