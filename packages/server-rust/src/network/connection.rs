//! Outbound message channels and the registry of open connections.
//!
//! Each connection gets a bounded mpsc channel for backpressure. The
//! transport's write loop owns the receiver and encodes every
//! [`OutboundMessage`] into a frame; sessions hold the sending half.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tether_core::messages::{self, CodecError};
use tether_core::Message;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Message queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Message(Box<Message>),
    /// Close the connection with an optional reason.
    Close(Option<String>),
}

impl OutboundMessage {
    /// Encodes a protocol message as a binary frame. `Close` has no payload.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the message cannot be serialized.
    pub fn to_frame(&self) -> Result<Option<Bytes>, CodecError> {
        match self {
            Self::Message(message) => Ok(Some(Bytes::from(messages::encode(message)?))),
            Self::Close(_) => Ok(None),
        }
    }

    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

impl From<Message> for OutboundMessage {
    fn from(message: Message) -> Self {
        Self::Message(Box::new(message))
    }
}

/// Sending to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The channel stayed full for the whole send timeout.
    #[error("outbound channel full for longer than the send timeout")]
    Timeout,
    /// The write loop has exited.
    #[error("connection closed")]
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    #[error("outbound channel full")]
    Full,
}

/// Sending half of one connection's outbound channel.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
    config: ConnectionConfig,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Creates an unregistered handle and the receiver for its write loop.
    #[must_use]
    pub fn new(id: ConnectionId, config: &ConnectionConfig) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let handle = Self {
            id,
            tx,
            config: config.clone(),
            connected_at: Instant::now(),
        };
        (handle, rx)
    }

    /// Queues a message, waiting up to the configured send timeout while the
    /// channel is full.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` or `SendError::Disconnected`.
    pub async fn send(&self, message: impl Into<OutboundMessage>) -> Result<(), SendError> {
        match tokio::time::timeout(self.config.send_timeout, self.tx.send(message.into())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Queues a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Full` or `SendError::Disconnected`.
    pub fn try_send(&self, message: impl Into<OutboundMessage>) -> Result<(), SendError> {
        self.tx.try_send(message.into()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Asks the write loop to close the connection.
    pub fn close(&self, reason: Option<String>) -> bool {
        self.try_send(OutboundMessage::Close(reason)).is_ok()
    }

    /// `false` once the write loop dropped its receiver.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Registry of open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the receiver
    /// for the transport's write loop.
    pub fn register(&self, config: &ConnectionConfig) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = ConnectionHandle::new(id, config);
        let handle = Arc::new(handle);
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every connection. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
