//! Default text UI endpoint: logs each line and echoes it to the sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Service, ServiceError, ServiceRequest};

/// Message name the TUI service registers under.
pub const TUI_MESSAGE: &str = "TUIMessage";

/// A line typed into the client's text UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuiMessage {
    pub text: String,
}

impl TuiMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        bincode::serialize(self).map_err(|e| ServiceError::Failed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ServiceError> {
        bincode::deserialize(bytes).map_err(|e| ServiceError::InvalidPayload(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct TuiService;

#[async_trait]
impl Service for TuiService {
    async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError> {
        let message = TuiMessage::from_bytes(&request.payload)?;
        tracing::info!(
            connection = %request.origin,
            text = %message.text,
            "TUIMessage received"
        );
        request.responder.reply(TUI_MESSAGE, request.payload).await
    }
}
