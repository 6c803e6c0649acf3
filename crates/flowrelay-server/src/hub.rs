//! Fan-out of flow updates to connected WebSocket clients.
//!
//! The hub owns the set of open connections. Each connection has a bounded
//! outbound queue drained by its own writer task, so a broadcast only enqueues
//! and never waits on a slow socket. A connection that cannot take a message
//! is evicted rather than silently skipped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use flowrelay_core::protocol::PONG;
use flowrelay_core::{ClientId, DecodeError, InboundMessage, MessageKind};

use crate::config::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("hub is shutting down")]
    ShuttingDown,

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }
}

/// Close code and reason the writer should send when the connection ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseNotice {
    pub const GOING_AWAY: Self = Self {
        code: 1001,
        reason: "server closing connection",
    };
    pub const INVALID_PAYLOAD: Self = Self {
        code: 1007,
        reason: "invalid frame payload",
    };
    pub const HEARTBEAT_TIMEOUT: Self = Self {
        code: 1008,
        reason: "heartbeat timeout",
    };
    pub const SLOW_CONSUMER: Self = Self {
        code: 1013,
        reason: "send queue full",
    };
}

/// One live client.
pub struct Connection {
    pub id: ClientId,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Arc<str>>,
    state: AtomicU8,
    last_pong: Mutex<Instant>,
    close_notice: Mutex<Option<CloseNotice>>,
    cancel: CancellationToken,
}

impl Connection {
    fn new(
        id: ClientId,
        peer: Option<SocketAddr>,
        tx: mpsc::Sender<Arc<str>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            connected_at: Utc::now(),
            tx,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            last_pong: Mutex::new(Instant::now()),
            close_notice: Mutex::new(None),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn try_send(&self, message: Arc<str>) -> Result<(), TrySendError<Arc<str>>> {
        self.tx.try_send(message)
    }

    /// Record liveness (pong or any inbound frame).
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Ask the writer to close with `notice`. The first notice wins.
    pub fn set_close_notice(&self, notice: CloseNotice) {
        let mut slot = self.close_notice.lock();
        if slot.is_none() {
            *slot = Some(notice);
        }
    }

    pub fn take_close_notice(&self) -> Option<CloseNotice> {
        self.close_notice.lock().take()
    }

    /// Resolves once the connection has been deregistered or the hub shut down.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.cancel.cancel();
    }
}

/// What happened to a single enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full or closed; the connection was removed.
    Evicted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Replied(Delivery),
    Broadcast(BroadcastReport),
    Ignored(String),
}

#[derive(Clone, Copy, Debug)]
pub struct HubConfig {
    pub max_send_queue: usize,
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for HubConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_send_queue: config.max_send_queue,
            echo_to_sender: config.echo_to_sender,
        }
    }
}

/// Registry of open connections and the relay between them.
pub struct ConnectionHub {
    connections: DashMap<ClientId, Arc<Connection>>,
    config: HubConfig,
    shutdown: CancellationToken,
}

impl ConnectionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new open connection and return it with its outbound queue.
    pub fn connect(
        &self,
        peer: Option<SocketAddr>,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Arc<str>>), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let (tx, rx) = mpsc::channel(self.config.max_send_queue);
        let conn = Arc::new(Connection::new(
            ClientId::new(),
            peer,
            tx,
            self.shutdown.child_token(),
        ));
        conn.set_state(ConnectionState::Open);
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));

        info!(
            client_id = %conn.id,
            peer = ?peer,
            active = self.connections.len(),
            "Client connected"
        );
        Ok((conn, rx))
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: &ClientId) -> bool {
        match self.connections.remove(id) {
            Some((_, conn)) => {
                conn.close();
                let connected_for = Utc::now() - conn.connected_at;
                info!(
                    client_id = %id,
                    peer = ?conn.peer,
                    connected_secs = connected_for.num_seconds(),
                    active = self.connections.len(),
                    "Client disconnected"
                );
                true
            }
            None => false,
        }
    }

    fn get(&self, id: &ClientId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Copy of the active set. No map guard outlives this call.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Queue a message for one connection.
    pub fn send_to(&self, id: &ClientId, message: Arc<str>) -> Result<Delivery, HubError> {
        let conn = self
            .get(id)
            .ok_or_else(|| HubError::UnknownClient(id.clone()))?;
        Ok(self.deliver(&conn, message))
    }

    /// Queue a message for every open connection except `exclude`.
    ///
    /// Recipients are independent: a closed or saturated queue evicts only
    /// its own connection.
    pub fn broadcast(&self, message: Arc<str>, exclude: Option<&ClientId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for conn in self.snapshot() {
            if exclude == Some(&conn.id) {
                continue;
            }
            report.recipients += 1;
            match self.deliver(&conn, Arc::clone(&message)) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Evicted => report.evicted += 1,
            }
        }

        debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            evicted = report.evicted,
            "Broadcast"
        );
        report
    }

    /// Decode one inbound frame from `from` and act on its `type`.
    pub fn dispatch(&self, from: &ClientId, raw: &str) -> Result<DispatchOutcome, HubError> {
        let message = InboundMessage::decode(raw)?;

        match &message.kind {
            MessageKind::Ping => {
                let delivery = self.send_to(from, Arc::from(PONG))?;
                Ok(DispatchOutcome::Replied(delivery))
            }
            MessageKind::FlowUpdate => {
                let exclude = if self.config.echo_to_sender {
                    None
                } else {
                    Some(from)
                };
                let report = self.broadcast(message.into_raw(), exclude);
                Ok(DispatchOutcome::Broadcast(report))
            }
            MessageKind::Unknown(tag) => {
                debug!(
                    client_id = %from,
                    message_type = message.kind.as_str(),
                    "Ignoring message"
                );
                Ok(DispatchOutcome::Ignored(tag.clone()))
            }
        }
    }

    /// Close every connection. Later `connect` calls fail with
    /// [`HubError::ShuttingDown`]. Returns how many were open.
    pub fn close_all(&self) -> usize {
        self.shutdown.cancel();
        let ids: Vec<ClientId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.disconnect(id)).count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn deliver(&self, conn: &Connection, message: Arc<str>) -> Delivery {
        match conn.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(msg)) => {
                warn!(
                    client_id = %conn.id,
                    msg_len = msg.len(),
                    "Send queue full, disconnecting slow client"
                );
                conn.set_close_notice(CloseNotice::SLOW_CONSUMER);
                self.disconnect(&conn.id);
                Delivery::Evicted
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id = %conn.id, "Send queue closed");
                self.disconnect(&conn.id);
                Delivery::Evicted
            }
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
