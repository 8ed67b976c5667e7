//! Service boundary and the built-in services.
//!
//! A service registers under a message name with the dispatcher. It receives
//! each decrypted request together with a [`Responder`] bound to the
//! connection that sent it.

mod broadcast;
mod chat_bot;
mod chat_room;
mod tui;

pub use broadcast::Broadcaster;
pub use chat_bot::{ChatBotService, CHAT_BOT_MESSAGE};
pub use chat_room::{ChatRoomService, CHAT_ROOM_MESSAGE};
pub use tui::{TuiMessage, TuiService, TUI_MESSAGE};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::protocol::{ClientInfo, ErrorInfo};

/// Payload that subscribes the sender to a broadcast service.
pub const START_SENTINEL: &str = "---Start---";

/// Payload that unsubscribes the sender from a broadcast service.
pub const STOP_SENTINEL: &str = "---Stop---";

/// Opaque handle naming one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors a service can report back to the dispatcher.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Service failed: {0}")]
    Failed(String),
}

/// Message queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Sealed with the connection's ratchet and sent as an AES envelope.
    Message {
        message_name: String,
        payload: Vec<u8>,
    },
    /// Sent as a plaintext error envelope.
    Error {
        message_name: String,
        error: ErrorInfo,
    },
}

/// Reply handle bound to a single connection.
#[derive(Debug, Clone)]
pub struct Responder {
    connection: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl Responder {
    pub fn new(connection: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { connection, tx }
    }

    /// Connection this responder writes to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queues a message for this connection.
    ///
    /// Waits while the connection's queue is full. Fails once the connection
    /// has shut down.
    pub async fn reply(
        &self,
        message_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), ServiceError> {
        self.send(Outbound::Message {
            message_name: message_name.into(),
            payload,
        })
        .await
    }

    /// Queues an error envelope for this connection.
    pub async fn reply_error(
        &self,
        message_name: impl Into<String>,
        error: ErrorInfo,
    ) -> Result<(), ServiceError> {
        self.send(Outbound::Error {
            message_name: message_name.into(),
            error,
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, outbound: Outbound) -> Result<(), ServiceError> {
        self.tx
            .send(outbound)
            .await
            .map_err(|_| ServiceError::ConnectionClosed(self.connection))
    }
}

/// One decrypted inbound message, consumed by exactly one service.
#[derive(Debug)]
pub struct ServiceRequest {
    pub origin: ConnectionId,
    pub message_name: String,
    pub payload: Vec<u8>,
    /// Identity negotiated during the handshake.
    pub client_info: Option<ClientInfo>,
    pub responder: Responder,
}

/// A pluggable handler registered with the dispatcher.
#[async_trait]
pub trait Service: Send {
    /// Handles one request. Errors are logged by the dispatcher and dropped.
    async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError>;
}

/// Chat line shared by the chat room and the chat bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub message: String,
    /// Server receive time, seconds since the UNIX epoch.
    pub timestamp: f64,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            message: message.into(),
            timestamp: 0.0,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        bincode::serialize(self).map_err(|e| ServiceError::Failed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ServiceError> {
        bincode::deserialize(bytes).map_err(|e| ServiceError::InvalidPayload(e.to_string()))
    }

    pub fn is_start(&self) -> bool {
        self.message == START_SENTINEL
    }

    pub fn is_stop(&self) -> bool {
        self.message == STOP_SENTINEL
    }
}

/// Builds a message from a request and stamps it with the server clock.
///
/// The negotiated identity, when known, replaces the author the client wrote.
pub(crate) fn stamp_chat_message(request: &ServiceRequest) -> Result<ChatMessage, ServiceError> {
    let mut message = ChatMessage::from_bytes(&request.payload)?;
    if let Some(info) = &request.client_info {
        message.author = info.username.clone();
    }
    message.timestamp = crate::crypto::now_epoch();
    Ok(message)
}
