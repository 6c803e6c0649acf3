//! One WebSocket connection: a reader feeding the hub and a writer draining
//! the connection's outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use flowrelay_core::DecodeError;

use crate::config::ServerConfig;
use crate::hub::{CloseNotice, Connection, ConnectionHub, DispatchOutcome, HubError};

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&ServerConfig> for SessionConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// Why one half of a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    PeerClosed,
    Transport(String),
    Decode(DecodeError),
    /// Deregistered elsewhere: evicted, the other half ended, or shutdown.
    Cancelled,
    HeartbeatTimeout,
}

/// Drive a connection until either side ends it, then deregister it.
pub async fn run_session(
    mut socket: WebSocket,
    hub: Arc<ConnectionHub>,
    peer: Option<SocketAddr>,
    config: SessionConfig,
) {
    let (conn, rx) = match hub.connect(peer) {
        Ok(registered) => registered,
        Err(e) => {
            debug!(peer = ?peer, error = %e, "Refusing connection");
            let _ = socket.send(close_message(CloseNotice::GOING_AWAY)).await;
            return;
        }
    };
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        Arc::clone(&conn),
        Arc::clone(&hub),
        config,
    ));

    let reader_end = read_loop(stream, &hub, &conn).await;
    if let SessionEnd::Decode(_) = reader_end {
        conn.set_close_notice(CloseNotice::INVALID_PAYLOAD);
    }
    hub.disconnect(&conn.id);

    let writer_end = writer.await.unwrap_or_else(|e| SessionEnd::Transport(e.to_string()));

    match (&reader_end, &writer_end) {
        (SessionEnd::Decode(e), _) => {
            warn!(client_id = %conn.id, error = %e, "Closing connection on undecodable frame");
        }
        (SessionEnd::Transport(e), _) | (_, SessionEnd::Transport(e)) => {
            warn!(client_id = %conn.id, error = %e, "WebSocket transport error");
        }
        (_, SessionEnd::HeartbeatTimeout) => {
            info!(client_id = %conn.id, "WebSocket heartbeat timed out");
        }
        _ => {
            debug!(
                client_id = %conn.id,
                reader = ?reader_end,
                writer = ?writer_end,
                "Session ended"
            );
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: &ConnectionHub,
    conn: &Connection,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            _ = conn.closed() => return SessionEnd::Cancelled,
            frame = stream.next() => frame,
        };

        let msg = match frame {
            None => return SessionEnd::PeerClosed,
            Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
            Some(Ok(msg)) => msg,
        };

        match msg {
            WsMessage::Text(text) => {
                conn.mark_alive();
                match hub.dispatch(&conn.id, text.as_str()) {
                    Ok(DispatchOutcome::Broadcast(report)) => {
                        trace!(
                            client_id = %conn.id,
                            recipients = report.recipients,
                            "Relayed flow update"
                        );
                    }
                    Ok(outcome) => {
                        trace!(client_id = %conn.id, ?outcome, "Dispatched message");
                    }
                    Err(HubError::Decode(e)) => return SessionEnd::Decode(e),
                    Err(HubError::UnknownClient(_) | HubError::ShuttingDown) => {
                        return SessionEnd::Cancelled;
                    }
                }
            }
            WsMessage::Binary(_) => return SessionEnd::Decode(DecodeError::Binary),
            WsMessage::Pong(_) => conn.mark_alive(),
            WsMessage::Ping(_) => {} // axum handles pong automatically
            WsMessage::Close(_) => return SessionEnd::PeerClosed,
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<str>>,
    conn: Arc<Connection>,
    hub: Arc<ConnectionHub>,
    config: SessionConfig,
) -> SessionEnd {
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
    ping_interval.tick().await; // consume first immediate tick

    let end = loop {
        tokio::select! {
            _ = conn.closed() => {
                let notice = conn.take_close_notice().unwrap_or(CloseNotice::GOING_AWAY);
                let _ = sink.send(close_message(notice)).await;
                break SessionEnd::Cancelled;
            }
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.to_string().into())).await {
                            break SessionEnd::Transport(e.to_string());
                        }
                    }
                    None => break SessionEnd::Cancelled,
                }
            }
            _ = ping_interval.tick() => {
                if conn.last_pong_elapsed() > config.heartbeat_timeout {
                    let _ = sink.send(close_message(CloseNotice::HEARTBEAT_TIMEOUT)).await;
                    break SessionEnd::HeartbeatTimeout;
                }
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    break SessionEnd::Transport(e.to_string());
                }
                trace!(client_id = %conn.id, "Sent ping");
            }
        }
    };

    hub.disconnect(&conn.id);
    end
}

fn close_message(notice: CloseNotice) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: notice.code,
        reason: Utf8Bytes::from_static(notice.reason),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_from_server_config() {
        let server = ServerConfig {
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            ..Default::default()
        };
        let config = SessionConfig::from(&server);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
    }

    #[test]
    fn close_message_carries_code_and_reason() {
        match close_message(CloseNotice::INVALID_PAYLOAD) {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1007);
                assert_eq!(frame.reason.as_str(), "invalid frame payload");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
