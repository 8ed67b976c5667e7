//! AES-128-GCM key ratchet for established sessions.
//!
//! Each ratchet holds a current key/nonce pair used for the next message and
//! a next pair that becomes current after it. The sender advertises the next
//! nonce, and a next key when it changes, inside every sealed frame, so both
//! ends rotate in lock step without a separate re-keying round trip.
//!
//! A fresh nonce is minted at every rotation, so no nonce repeats under a key.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128 key length.
pub const KEY_LEN: usize = 16;

/// GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// GCM tag length.
pub const TAG_LEN: usize = 16;

/// Messages a server or relay sends under one key before forcing a new one.
pub const SERVER_MAX_USAGE: u32 = 10;

/// Messages a leaf client sends under one key before forcing a new one.
pub const CLIENT_MAX_USAGE: u32 = 20;

/// Errors that can occur in the ratchet.
#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("Authentication tag mismatch")]
    AuthenticationTagMismatch,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Malformed sealed frame: {0}")]
    MalformedFrame(String),
}

/// Role of the peer that owns a sending ratchet. Decides `max_usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    /// Server or relay.
    Server,
    /// Leaf client.
    Client,
}

impl PeerClass {
    /// Key usage limit for this class.
    pub fn max_usage(self) -> u32 {
        match self {
            Self::Server => SERVER_MAX_USAGE,
            Self::Client => CLIENT_MAX_USAGE,
        }
    }
}

/// Key material advertised for the peer's next slot.
///
/// `key` is only present when it differs from the key just used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdate {
    pub key: Option<Vec<u8>>,
    pub nonce: Vec<u8>,
}

/// Plaintext layout inside the AEAD.
#[derive(Serialize, Deserialize)]
struct SealedFrame {
    message: Vec<u8>,
    update: KeyUpdate,
}

/// Output of [`Ratchet::seal`].
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    /// The update embedded in the frame, for callers that log or inspect it.
    pub rotation: KeyUpdate,
}

/// One direction of an encrypted channel.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Ratchet {
    current_key: [u8; KEY_LEN],
    current_nonce: [u8; NONCE_LEN],
    next_key: [u8; KEY_LEN],
    next_nonce: [u8; NONCE_LEN],
    usage_count: u32,
    max_usage: u32,
}

impl Ratchet {
    /// Creates a ratchet from optional seed material.
    ///
    /// Missing key or nonce is generated randomly. The next nonce is always
    /// fresh.
    pub fn new(
        key: Option<[u8; KEY_LEN]>,
        nonce: Option<[u8; NONCE_LEN]>,
        max_usage: u32,
    ) -> Self {
        let current_key = key.unwrap_or_else(random_key);
        let current_nonce = nonce.unwrap_or_else(random_nonce);
        Self {
            current_key,
            current_nonce,
            next_key: current_key,
            next_nonce: random_nonce(),
            usage_count: 0,
            max_usage,
        }
    }

    /// Builds a ratchet from untrusted slices, as received in a handshake.
    pub fn from_slices(key: &[u8], nonce: &[u8], max_usage: u32) -> Result<Self, RatchetError> {
        Ok(Self::new(
            Some(to_key(key)?),
            Some(to_nonce(nonce)?),
            max_usage,
        ))
    }

    /// Seals `plaintext` under the current key/nonce, then rotates.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Sealed, RatchetError> {
        if self.usage_count >= self.max_usage {
            self.next_key = fresh_key_distinct_from(&self.current_key);
        }

        let rotation = KeyUpdate {
            key: (self.next_key != self.current_key).then(|| self.next_key.to_vec()),
            nonce: self.next_nonce.to_vec(),
        };
        let frame = SealedFrame {
            message: plaintext.to_vec(),
            update: rotation.clone(),
        };
        let mut buffer =
            bincode::serialize(&frame).map_err(|e| RatchetError::MalformedFrame(e.to_string()))?;

        let tag = self
            .cipher()
            .encrypt_in_place_detached(Nonce::from_slice(&self.current_nonce), b"", &mut buffer)
            .map_err(|_| RatchetError::EncryptionFailed)?;

        self.rotate();
        Ok(Sealed {
            ciphertext: buffer,
            tag: tag.to_vec(),
            rotation,
        })
    }

    /// Authenticates and decrypts under the current key/nonce.
    ///
    /// On failure the state is left untouched. On success the peer's update is
    /// applied to the next slot and the ratchet rotates.
    pub fn open(&mut self, ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>, RatchetError> {
        if tag.len() != TAG_LEN {
            return Err(RatchetError::AuthenticationTagMismatch);
        }

        let mut buffer = ciphertext.to_vec();
        self.cipher()
            .decrypt_in_place_detached(
                Nonce::from_slice(&self.current_nonce),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| RatchetError::AuthenticationTagMismatch)?;

        let frame: SealedFrame = bincode::deserialize(&buffer)
            .map_err(|e| RatchetError::MalformedFrame(e.to_string()))?;
        buffer.zeroize();

        let next_nonce = to_nonce(&frame.update.nonce)?;
        let next_key = match &frame.update.key {
            Some(key) => Some(to_key(key)?),
            None => None,
        };

        self.next_nonce = next_nonce;
        if let Some(key) = next_key {
            self.next_key = key;
        }
        self.rotate();
        Ok(frame.message)
    }

    /// Nonce the next seal or open will use.
    pub fn current_nonce(&self) -> &[u8; NONCE_LEN] {
        &self.current_nonce
    }

    /// Messages processed under the current key.
    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    pub fn max_usage(&self) -> u32 {
        self.max_usage
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.current_key))
    }

    fn rotate(&mut self) {
        if self.next_key == self.current_key {
            self.usage_count += 1;
        } else {
            self.usage_count = 0;
        }
        self.current_key = self.next_key;
        self.current_nonce = self.next_nonce;
        self.next_nonce = random_nonce();
    }
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("usage_count", &self.usage_count)
            .field("max_usage", &self.max_usage)
            .finish_non_exhaustive()
    }
}

/// Generates a random AES-128 key.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generates a random GCM nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn fresh_key_distinct_from(current: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    loop {
        let key = random_key();
        if &key != current {
            return key;
        }
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], RatchetError> {
    bytes.try_into().map_err(|_| {
        RatchetError::InvalidKeyMaterial(format!("key must be {} bytes, got {}", KEY_LEN, bytes.len()))
    })
}

fn to_nonce(bytes: &[u8]) -> Result<[u8; NONCE_LEN], RatchetError> {
    bytes.try_into().map_err(|_| {
        RatchetError::InvalidKeyMaterial(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            bytes.len()
        ))
    })
}
