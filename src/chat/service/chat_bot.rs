//! Chat bot channel: a broadcast room that remembers its recent lines.

use async_trait::async_trait;

use crate::chat::config::DEFAULT_HISTORY_LEN;

use super::{stamp_chat_message, Broadcaster, Service, ServiceError, ServiceRequest};

/// Message name the chat bot registers under.
pub const CHAT_BOT_MESSAGE: &str = "ChatBotMessage";

/// Broadcast channel with a bounded history replayed on subscribe.
#[derive(Debug)]
pub struct ChatBotService {
    channel: Broadcaster,
}

impl ChatBotService {
    pub fn new(history_len: usize) -> Self {
        Self {
            channel: Broadcaster::new(history_len),
        }
    }

    pub fn history_len(&self) -> usize {
        self.channel.history().count()
    }
}

impl Default for ChatBotService {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

#[async_trait]
impl Service for ChatBotService {
    async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError> {
        let message = stamp_chat_message(&request)?;

        if message.is_start() {
            let subscribed = self
                .channel
                .subscribe(request.responder, CHAT_BOT_MESSAGE)
                .await;
            tracing::info!(author = %message.author, subscribed, "Chat bot subscriber");
        } else if message.is_stop() {
            self.channel.unsubscribe(request.origin);
        } else {
            let payload = message.to_bytes()?;
            self.channel.record(payload.clone());
            self.channel.broadcast(CHAT_BOT_MESSAGE, &payload).await;
        }
        Ok(())
    }
}
