//! Cryptographic building blocks for aioserver.
//!
//! This module provides:
//! - RSA-OAEP (SHA3-256) key pairs for the handshake
//! - Persistence of the server key as hex-wrapped PKCS#8
//! - The AES-128-GCM ratchet used once a session is established

pub mod asymmetric;
pub mod keys;
pub mod ratchet;

pub use asymmetric::{
    now_epoch, AsymmetricError, KeyPair, PublicKey, DEFAULT_MODULUS_BITS, EXPONENT_LEN,
    MIN_MODULUS_BITS,
};
pub use keys::{decode_private_key, encode_private_key, load_or_create, save_private_key, KeyError};
pub use ratchet::{
    random_key, random_nonce, KeyUpdate, PeerClass, Ratchet, RatchetError, Sealed, KEY_LEN,
    NONCE_LEN, TAG_LEN,
};
