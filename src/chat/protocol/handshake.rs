//! Five-step handshake that bootstraps an AES ratchet from RSA keys.
//!
//! ## Flow
//!
//! 1. Client sends `NewSession` with its public key (plaintext)
//! 2. Server replies `NewRsa` with its public key (plaintext)
//! 3. Client sends `Confirmation` encrypted to the server key (RSA)
//! 4. Server replies `NewAes` with the ratchet seed, encrypted to the client key (RSA)
//! 5. Client sends `Confirmation` sealed with the new ratchet (AES)
//!
//! Steps 1 and 2 carry only public keys. An OAEP block cannot hold a modulus
//! of its own size, so those travel in the clear. Every step is still bound
//! to one encryption mode, and a step under any other mode is a sequence
//! error, so a peer cannot downgrade a later step.
//!
//! Both machines are pure: they consume envelopes and return the envelope to
//! send next. The connection actor and the client do all I/O.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;
use crate::chat::protocol::envelope::{Body, ClientInfo, EncryptionMode, Envelope};
use crate::crypto::{
    random_key, random_nonce, KeyPair, KeyUpdate, PeerClass, PublicKey, Ratchet, KEY_LEN,
    NONCE_LEN,
};

/// Message name every handshake envelope travels under.
pub const AUTHENTICATOR: &str = "Authenticator";

/// Handshake step carried in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationStep {
    NewSession,
    NewRsa,
    Confirmation,
    NewAes,
}

/// RSA public key as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaPublicKeyParts {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub step: AuthenticationStep,
    pub rsa_public_key: Option<RsaPublicKeyParts>,
    pub aes_key_update: Option<KeyUpdate>,
}

impl HandshakeMessage {
    fn step(step: AuthenticationStep) -> Self {
        Self {
            step,
            rsa_public_key: None,
            aes_key_update: None,
        }
    }

    fn with_public_key(step: AuthenticationStep, key: &PublicKey) -> Self {
        let (modulus, exponent) = key.to_parts();
        Self {
            rsa_public_key: Some(RsaPublicKeyParts { modulus, exponent }),
            ..Self::step(step)
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatError> {
        bincode::serialize(self).map_err(|e| ChatError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChatError> {
        bincode::deserialize(bytes).map_err(|e| {
            ChatError::MalformedEnvelope(format!("bad handshake payload: {}", e))
        })
    }
}

/// Progress of one side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet.
    AwaitingSession,
    /// Server: sent step 2, waiting for step 3.
    AwaitingRsaAck,
    /// Client: sent step 1, waiting for step 2.
    AwaitingConfirmation1,
    /// Server: sent step 4, waiting for step 5.
    AwaitingAesAck,
    /// Client: sent step 3, waiting for step 4.
    AwaitingConfirmation2,
    Established,
}

/// The pair of ratchets an established session runs on, one per direction.
#[derive(Debug)]
pub struct SecureChannel {
    pub outbound: Ratchet,
    pub inbound: Ratchet,
}

impl SecureChannel {
    /// Client side: sends on the seed, receives on the reversed nonce.
    pub fn for_client(key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            outbound: Ratchet::new(Some(key), Some(nonce), PeerClass::Client.max_usage()),
            inbound: Ratchet::new(
                Some(key),
                Some(reverse_nonce(nonce)),
                PeerClass::Server.max_usage(),
            ),
        }
    }

    /// Server side: mirror of [`SecureChannel::for_client`].
    pub fn for_server(key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            outbound: Ratchet::new(
                Some(key),
                Some(reverse_nonce(nonce)),
                PeerClass::Server.max_usage(),
            ),
            inbound: Ratchet::new(Some(key), Some(nonce), PeerClass::Client.max_usage()),
        }
    }
}

/// Server-to-client starting nonce. Differs from the client's in the low bit.
fn reverse_nonce(mut nonce: [u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    nonce[NONCE_LEN - 1] ^= 0x01;
    nonce
}

/// What the driver must do after feeding an envelope to a handshake.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Send this envelope and keep waiting.
    Send(Envelope),
    /// The session is up. Send `reply` if present, then switch to the channel.
    Established {
        reply: Option<Envelope>,
        channel: SecureChannel,
    },
}

/// Rejects envelopes that are not the expected handshake step and mode.
fn expect_envelope(
    envelope: &Envelope,
    step: AuthenticationStep,
    mode: EncryptionMode,
) -> Result<(), ChatError> {
    if let Some(error) = &envelope.error {
        return Err(ChatError::Remote {
            code: error.code,
            details: error.details.clone(),
        });
    }
    if envelope.message_name != AUTHENTICATOR {
        return Err(ChatError::sequence(
            format!("{:?} step", step),
            format!("{} message", envelope.message_name),
        ));
    }
    if envelope.mode() != mode {
        return Err(ChatError::sequence(
            format!("{:?} step over {:?}", step, mode),
            format!("{:?} envelope", envelope.mode()),
        ));
    }
    Ok(())
}

fn expect_step(message: &HandshakeMessage, step: AuthenticationStep) -> Result<(), ChatError> {
    if message.step != step {
        return Err(ChatError::sequence(
            format!("{:?} step", step),
            format!("{:?} step", message.step),
        ));
    }
    Ok(())
}

fn expect_epoch(envelope: &Envelope, epoch: f64) -> Result<(), ChatError> {
    if envelope.encryption_timestamp != epoch {
        return Err(ChatError::sequence(
            format!("key epoch {}", epoch),
            format!("key epoch {}", envelope.encryption_timestamp),
        ));
    }
    Ok(())
}

fn plaintext_of(envelope: &Envelope) -> &[u8] {
    match &envelope.body {
        Body::Plaintext(payload) => payload,
        _ => &[],
    }
}

fn ciphertext_of(envelope: &Envelope) -> &[u8] {
    match &envelope.body {
        Body::Rsa { ciphertext } | Body::Aes { ciphertext, .. } => ciphertext,
        Body::Plaintext(_) => &[],
    }
}

fn public_key_of(message: &HandshakeMessage) -> Result<PublicKey, ChatError> {
    let parts = message.rsa_public_key.as_ref().ok_or_else(|| {
        ChatError::MalformedEnvelope(format!("{:?} without a public key", message.step))
    })?;
    Ok(PublicKey::from_parts(&parts.modulus, &parts.exponent)?)
}

/// Server side of the handshake.
pub struct ServerHandshake {
    state: HandshakeState,
    server_key: Arc<KeyPair>,
    client_key: Option<PublicKey>,
    client_epoch: Option<f64>,
    identity: Option<ClientInfo>,
    channel: Option<SecureChannel>,
}

impl ServerHandshake {
    pub fn new(server_key: Arc<KeyPair>) -> Self {
        Self {
            state: HandshakeState::AwaitingSession,
            server_key,
            client_key: None,
            client_epoch: None,
            identity: None,
            channel: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Identity the client announced in step 1.
    pub fn identity(&self) -> Option<&ClientInfo> {
        self.identity.as_ref()
    }

    /// Key epoch the client announced in step 1.
    pub fn client_epoch(&self) -> Option<f64> {
        self.client_epoch
    }

    /// Feeds one inbound envelope.
    ///
    /// Sequence errors are fatal to the connection. Crypto and decoding
    /// errors leave the state unchanged so the driver can reply and continue.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        match self.state {
            HandshakeState::AwaitingSession => self.on_new_session(envelope),
            HandshakeState::AwaitingRsaAck => self.on_rsa_confirmation(envelope),
            HandshakeState::AwaitingAesAck => self.on_aes_confirmation(envelope),
            state => Err(ChatError::sequence(
                "no handshake traffic",
                format!("{:?} envelope in {:?}", envelope.mode(), state),
            )),
        }
    }

    fn epoch(&self) -> f64 {
        self.client_epoch.unwrap_or_default()
    }

    fn on_new_session(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        expect_envelope(envelope, AuthenticationStep::NewSession, EncryptionMode::Plaintext)?;
        let message = HandshakeMessage::from_bytes(plaintext_of(envelope))?;
        expect_step(&message, AuthenticationStep::NewSession)?;
        let client_key = public_key_of(&message)?;

        let reply = HandshakeMessage::with_public_key(
            AuthenticationStep::NewRsa,
            self.server_key.public_key(),
        );
        let reply = Envelope::plaintext(
            envelope.encryption_timestamp,
            AUTHENTICATOR,
            reply.to_bytes()?,
        );

        tracing::debug!(
            client = ?envelope.client_info,
            modulus_bits = client_key.modulus_bits(),
            "Handshake step 1 accepted"
        );
        self.client_key = Some(client_key);
        self.client_epoch = Some(envelope.encryption_timestamp);
        self.identity = envelope.client_info.clone();
        self.state = HandshakeState::AwaitingRsaAck;
        Ok(HandshakeAction::Send(reply))
    }

    fn on_rsa_confirmation(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        expect_envelope(envelope, AuthenticationStep::Confirmation, EncryptionMode::Rsa)?;
        expect_epoch(envelope, self.epoch())?;
        let plaintext = self.server_key.decrypt(ciphertext_of(envelope))?;
        let message = HandshakeMessage::from_bytes(&plaintext)?;
        expect_step(&message, AuthenticationStep::Confirmation)?;

        let client_key = self
            .client_key
            .as_ref()
            .ok_or_else(|| ChatError::sequence("client key from step 1", "none recorded"))?;

        let key = random_key();
        let nonce = random_nonce();
        let seed = HandshakeMessage {
            aes_key_update: Some(KeyUpdate {
                key: Some(key.to_vec()),
                nonce: nonce.to_vec(),
            }),
            ..HandshakeMessage::step(AuthenticationStep::NewAes)
        };
        let ciphertext = client_key.encrypt(&seed.to_bytes()?)?;

        tracing::debug!("Handshake step 3 accepted, sending session key");
        self.channel = Some(SecureChannel::for_server(key, nonce));
        self.state = HandshakeState::AwaitingAesAck;
        Ok(HandshakeAction::Send(Envelope::rsa(
            self.epoch(),
            AUTHENTICATOR,
            ciphertext,
        )))
    }

    fn on_aes_confirmation(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        expect_envelope(envelope, AuthenticationStep::Confirmation, EncryptionMode::Aes)?;
        expect_epoch(envelope, self.epoch())?;

        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ChatError::sequence("session key from step 4", "none generated"))?;
        let plaintext = match &envelope.body {
            Body::Aes { ciphertext, tag } => channel.inbound.open(ciphertext, tag)?,
            _ => Vec::new(),
        };
        let message = HandshakeMessage::from_bytes(&plaintext)?;
        expect_step(&message, AuthenticationStep::Confirmation)?;

        let channel = self
            .channel
            .take()
            .ok_or_else(|| ChatError::sequence("session key from step 4", "none generated"))?;
        tracing::debug!("Handshake step 5 accepted");
        self.state = HandshakeState::Established;
        Ok(HandshakeAction::Established {
            reply: None,
            channel,
        })
    }
}

/// Client side of the handshake.
pub struct ClientHandshake {
    state: HandshakeState,
    keypair: KeyPair,
    client_info: ClientInfo,
    server_key: Option<PublicKey>,
}

impl ClientHandshake {
    pub fn new(keypair: KeyPair, username: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::AwaitingSession,
            keypair,
            client_info: ClientInfo::new(username),
            server_key: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Epoch of the client key; every handshake envelope carries it.
    pub fn epoch(&self) -> f64 {
        self.keypair.epoch()
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.client_info
    }

    /// Server key learned in step 2.
    pub fn server_key(&self) -> Option<&PublicKey> {
        self.server_key.as_ref()
    }

    /// Produces step 1.
    pub fn start(&mut self) -> Result<Envelope, ChatError> {
        if self.state != HandshakeState::AwaitingSession {
            return Err(ChatError::sequence(
                "fresh handshake",
                format!("{:?}", self.state),
            ));
        }
        let message = HandshakeMessage::with_public_key(
            AuthenticationStep::NewSession,
            self.keypair.public_key(),
        );
        let envelope = Envelope::plaintext(self.epoch(), AUTHENTICATOR, message.to_bytes()?)
            .with_client_info(self.client_info.clone());

        self.state = HandshakeState::AwaitingConfirmation1;
        Ok(envelope)
    }

    /// Feeds one envelope from the server.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        match self.state {
            HandshakeState::AwaitingConfirmation1 => self.on_new_rsa(envelope),
            HandshakeState::AwaitingConfirmation2 => self.on_new_aes(envelope),
            state => Err(ChatError::sequence(
                "no handshake traffic",
                format!("{:?} envelope in {:?}", envelope.mode(), state),
            )),
        }
    }

    fn on_new_rsa(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        expect_envelope(envelope, AuthenticationStep::NewRsa, EncryptionMode::Plaintext)?;
        expect_epoch(envelope, self.epoch())?;
        let message = HandshakeMessage::from_bytes(plaintext_of(envelope))?;
        expect_step(&message, AuthenticationStep::NewRsa)?;
        let server_key = public_key_of(&message)?;

        let confirmation = HandshakeMessage::step(AuthenticationStep::Confirmation).to_bytes()?;
        let ciphertext = server_key.encrypt(&confirmation)?;

        self.server_key = Some(server_key);
        self.state = HandshakeState::AwaitingConfirmation2;
        Ok(HandshakeAction::Send(
            Envelope::rsa(self.epoch(), AUTHENTICATOR, ciphertext)
                .with_client_info(self.client_info.clone()),
        ))
    }

    fn on_new_aes(&mut self, envelope: &Envelope) -> Result<HandshakeAction, ChatError> {
        expect_envelope(envelope, AuthenticationStep::NewAes, EncryptionMode::Rsa)?;
        expect_epoch(envelope, self.epoch())?;
        let plaintext = self.keypair.decrypt(ciphertext_of(envelope))?;
        let message = HandshakeMessage::from_bytes(&plaintext)?;
        expect_step(&message, AuthenticationStep::NewAes)?;

        let update = message.aes_key_update.as_ref().ok_or_else(|| {
            ChatError::MalformedEnvelope("NewAes without a key update".to_string())
        })?;
        let key_bytes = update.key.as_deref().ok_or_else(|| {
            ChatError::MalformedEnvelope("NewAes without an initial key".to_string())
        })?;
        let key: [u8; KEY_LEN] = key_bytes.try_into().map_err(|_| {
            ChatError::MalformedEnvelope(format!("initial key is {} bytes", key_bytes.len()))
        })?;
        let nonce: [u8; NONCE_LEN] = update.nonce.as_slice().try_into().map_err(|_| {
            ChatError::MalformedEnvelope(format!("initial nonce is {} bytes", update.nonce.len()))
        })?;

        let mut channel = SecureChannel::for_client(key, nonce);
        let confirmation = HandshakeMessage::step(AuthenticationStep::Confirmation).to_bytes()?;
        let sealed = channel.outbound.seal(&confirmation)?;
        let reply = Envelope::aes(self.epoch(), AUTHENTICATOR, sealed.ciphertext, sealed.tag)
            .with_client_info(self.client_info.clone());

        self.state = HandshakeState::Established;
        Ok(HandshakeAction::Established {
            reply: Some(reply),
            channel,
        })
    }
}
