//! Chat room: every subscriber sees every line.

use async_trait::async_trait;

use super::{stamp_chat_message, Broadcaster, ChatMessage, Service, ServiceError, ServiceRequest};

/// Message name the chat room registers under.
pub const CHAT_ROOM_MESSAGE: &str = "ChatRoomMessage";

/// Broadcast chat room without history.
///
/// The start sentinel subscribes the sender and announces it to the room.
/// The stop sentinel unsubscribes the sender. Anything else is broadcast.
#[derive(Debug, Default)]
pub struct ChatRoomService {
    room: Broadcaster,
}

impl ChatRoomService {
    pub fn new() -> Self {
        Self {
            room: Broadcaster::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.room.subscriber_count()
    }

    async fn broadcast(&mut self, message: &ChatMessage) -> Result<(), ServiceError> {
        let delivered = self
            .room
            .broadcast(CHAT_ROOM_MESSAGE, &message.to_bytes()?)
            .await;
        tracing::debug!(author = %message.author, delivered, "Chat room broadcast");
        Ok(())
    }
}

#[async_trait]
impl Service for ChatRoomService {
    async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError> {
        let message = stamp_chat_message(&request)?;

        if message.is_start() {
            self.room
                .subscribe(request.responder, CHAT_ROOM_MESSAGE)
                .await;
            let notice = ChatMessage {
                message: format!("{} has connected!", message.author),
                ..message
            };
            tracing::info!(author = %notice.author, "User joined chat room");
            self.broadcast(&notice).await
        } else if message.is_stop() {
            self.room.unsubscribe(request.origin);
            tracing::info!(author = %message.author, "User left chat room");
            Ok(())
        } else {
            self.broadcast(&message).await
        }
    }
}
