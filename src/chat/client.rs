//! Client side of a connection.
//!
//! [`Client::connect`] runs the handshake and returns an established session.
//! The session can be split so that one task sends while another receives.

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::chat::config::ClientConfig;
use crate::chat::error::ChatError;
use crate::chat::protocol::{
    Body, ClientHandshake, ClientInfo, Envelope, HandshakeAction, SecureChannel,
};
use crate::chat::transport::{EnvelopeReader, EnvelopeWriter, MessageTransport, TcpConnection};
use crate::crypto::{AsymmetricError, KeyPair, Ratchet};

/// One decrypted message from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub message_name: String,
    pub payload: Vec<u8>,
}

/// Sending half of an established session.
pub struct ClientSender {
    writer: EnvelopeWriter<WriteHalf<TcpStream>>,
    ratchet: Ratchet,
    epoch: f64,
    client_info: ClientInfo,
}

impl ClientSender {
    /// Seals `payload` and sends it under `message_name`.
    pub async fn send(&mut self, message_name: &str, payload: &[u8]) -> Result<(), ChatError> {
        let sealed = self.ratchet.seal(payload)?;
        let envelope = Envelope::aes(self.epoch, message_name, sealed.ciphertext, sealed.tag)
            .with_client_info(self.client_info.clone());
        self.writer.send(&envelope).await
    }

    /// Sends a raw envelope without touching the ratchet.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        self.writer.send(envelope).await
    }

    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.close().await
    }
}

/// Receiving half of an established session.
pub struct ClientReceiver {
    reader: EnvelopeReader<ReadHalf<TcpStream>>,
    ratchet: Ratchet,
}

impl ClientReceiver {
    /// Waits for the next message.
    ///
    /// An error envelope from the server is returned as
    /// [`ChatError::Remote`]; the session stays usable.
    pub async fn recv(&mut self) -> Result<ClientMessage, ChatError> {
        let envelope = self.reader.receive().await?;
        if let Some(error) = envelope.error {
            return Err(ChatError::Remote {
                code: error.code,
                details: error.details,
            });
        }
        match envelope.body {
            Body::Aes { ciphertext, tag } => Ok(ClientMessage {
                message_name: envelope.message_name,
                payload: self.ratchet.open(&ciphertext, &tag)?,
            }),
            other => Err(ChatError::sequence(
                "AES envelope",
                format!("{:?} envelope", other.mode()),
            )),
        }
    }
}

/// An established session with the server.
pub struct Client {
    sender: ClientSender,
    receiver: ClientReceiver,
}

impl Client {
    /// Generates a session key and connects using `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ChatError> {
        if config.username.trim().is_empty() {
            return Err(ChatError::ConfigError("username is required".to_string()));
        }
        let bits = config.modulus_bits;
        let keypair = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|e| AsymmetricError::KeyGeneration(e.to_string()))??;

        Self::connect_with_key(
            &config.server_addr,
            &config.username,
            keypair,
            config.max_frame_len,
        )
        .await
    }

    /// Connects with an existing key pair.
    pub async fn connect_with_key(
        addr: &str,
        username: &str,
        keypair: KeyPair,
        max_frame_len: usize,
    ) -> Result<Self, ChatError> {
        let mut transport = TcpConnection::connect(addr, max_frame_len).await?;
        let mut handshake = ClientHandshake::new(keypair, username);

        transport.send(&handshake.start()?).await?;
        let channel = loop {
            let envelope = transport.receive().await?;
            match handshake.handle(&envelope)? {
                HandshakeAction::Send(next) => transport.send(&next).await?,
                HandshakeAction::Established { reply, channel } => {
                    if let Some(reply) = reply {
                        transport.send(&reply).await?;
                    }
                    break channel;
                }
            }
        };
        tracing::debug!(server = %addr, user = %username, "Handshake complete");

        let SecureChannel { outbound, inbound } = channel;
        let (reader, writer) = transport.into_split();
        Ok(Self {
            sender: ClientSender {
                writer,
                ratchet: outbound,
                epoch: handshake.epoch(),
                client_info: handshake.client_info().clone(),
            },
            receiver: ClientReceiver {
                reader,
                ratchet: inbound,
            },
        })
    }

    pub fn username(&self) -> &str {
        &self.sender.client_info.username
    }

    pub async fn send(&mut self, message_name: &str, payload: &[u8]) -> Result<(), ChatError> {
        self.sender.send(message_name, payload).await
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        self.sender.send_envelope(envelope).await
    }

    pub async fn recv(&mut self) -> Result<ClientMessage, ChatError> {
        self.receiver.recv().await
    }

    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.sender.close().await
    }

    pub fn into_split(self) -> (ClientSender, ClientReceiver) {
        (self.sender, self.receiver)
    }
}
