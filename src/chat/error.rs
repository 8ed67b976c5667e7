//! Chat error types.

use thiserror::Error;

use crate::chat::protocol::ErrorCode;
use crate::crypto::{AsymmetricError, KeyError, RatchetError};

/// Errors that can occur on a chat connection or in the server around it.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Envelope bytes could not be decoded or broke the mode/body invariant.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// RSA encryption or decryption failed.
    #[error("Asymmetric crypto error: {0}")]
    AsymmetricCrypto(#[from] AsymmetricError),

    /// The symmetric ratchet rejected a message.
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),

    /// A message arrived that does not fit the current protocol state.
    #[error("Protocol sequence error: expected {expected}, got {got}")]
    ProtocolSequence {
        /// What the state machine was waiting for.
        expected: String,
        /// What actually arrived.
        got: String,
    },

    /// A service was registered twice under the same message name.
    #[error("Duplicate service name: {0}")]
    DuplicateServiceName(String),

    /// The persisted key could not be loaded or written.
    #[error("Key load error: {0}")]
    KeyLoad(#[from] KeyError),

    /// The peer answered with an error envelope.
    #[error("Remote error ({code:?}): {details}")]
    Remote {
        /// Error code sent by the peer.
        code: ErrorCode,
        /// Human readable details sent by the peer.
        details: String,
    },

    /// A frame length exceeded the configured maximum.
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Transport error.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The dispatcher task is no longer running.
    #[error("Dispatcher stopped")]
    DispatcherStopped,

    /// Configuration could not be read or written.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    /// Shorthand for a sequence violation.
    pub fn sequence(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ProtocolSequence {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Whether the connection can survive this error with an error reply.
    ///
    /// Single bad messages are recoverable. Sequence violations and anything
    /// that breaks the byte stream are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope(_)
                | Self::AsymmetricCrypto(_)
                | Self::Ratchet(_)
        )
    }

    /// Wire error code reported to the peer for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MalformedEnvelope(_) | Self::SerializationFailed(_) => {
                ErrorCode::MalformedEnvelope
            }
            Self::AsymmetricCrypto(AsymmetricError::EncryptionFailed(_)) => {
                ErrorCode::EncryptionError
            }
            Self::AsymmetricCrypto(_) => ErrorCode::DecryptionError,
            Self::Ratchet(RatchetError::AuthenticationTagMismatch) => {
                ErrorCode::AuthenticationFailed
            }
            Self::Ratchet(_) => ErrorCode::DecryptionError,
            Self::ProtocolSequence { .. } => ErrorCode::ProtocolSequence,
            _ => ErrorCode::Internal,
        }
    }
}
