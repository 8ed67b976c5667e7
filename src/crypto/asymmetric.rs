//! RSA-OAEP for the session handshake.
//!
//! RSA only ever carries handshake payloads: a confirmation and the initial
//! AES key. Payloads are never chunked, so callers must stay under
//! [`PublicKey::max_plaintext_len`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha3::Sha3_256;
use thiserror::Error;

/// Default modulus size for generated keys.
pub const DEFAULT_MODULUS_BITS: usize = 2048;

/// Smallest modulus accepted from a peer. Anything smaller cannot carry the
/// initial AES key under OAEP-SHA3-256.
pub const MIN_MODULUS_BITS: usize = 1024;

/// Width of the public exponent on the wire.
pub const EXPONENT_LEN: usize = 4;

/// SHA3-256 output length, used for the OAEP overhead.
const HASH_LEN: usize = 32;

/// Errors that can occur during RSA operations.
#[derive(Error, Debug)]
pub enum AsymmetricError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Payload too large for OAEP: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Seconds since the UNIX epoch as a float, the unit used for key epochs.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The public half of an RSA key, as received from a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Rebuilds a public key from its big-endian wire parts.
    pub fn from_parts(modulus: &[u8], exponent: &[u8]) -> Result<Self, AsymmetricError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(exponent);
        let inner = RsaPublicKey::new(n, e)
            .map_err(|e| AsymmetricError::InvalidPublicKey(e.to_string()))?;

        let key = Self { inner };
        if key.modulus_bits() < MIN_MODULUS_BITS {
            return Err(AsymmetricError::InvalidPublicKey(format!(
                "modulus is {} bits, need at least {}",
                key.modulus_bits(),
                MIN_MODULUS_BITS
            )));
        }
        Ok(key)
    }

    /// Returns `(modulus, exponent)` in fixed-width big-endian form.
    ///
    /// The modulus is padded to the modulus byte length and the exponent to
    /// [`EXPONENT_LEN`] bytes.
    pub fn to_parts(&self) -> (Vec<u8>, Vec<u8>) {
        let modulus = left_pad(self.inner.n().to_bytes_be(), self.inner.size());
        let exponent = left_pad(self.inner.e().to_bytes_be(), EXPONENT_LEN);
        (modulus, exponent)
    }

    /// Modulus size in bits.
    pub fn modulus_bits(&self) -> usize {
        self.inner.size() * 8
    }

    /// Largest plaintext a single OAEP block can hold under this key.
    pub fn max_plaintext_len(&self) -> usize {
        self.inner.size().saturating_sub(2 * HASH_LEN + 2)
    }

    /// Encrypts one blob with OAEP (SHA3-256).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(AsymmetricError::PayloadTooLarge {
                len: plaintext.len(),
                max,
            });
        }
        self.inner
            .encrypt(&mut OsRng, Oaep::new::<Sha3_256>(), plaintext)
            .map_err(|e| AsymmetricError::EncryptionFailed(e.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("modulus_bits", &self.modulus_bits())
            .finish()
    }
}

/// An RSA private key with the epoch it was created in.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKey,
    epoch: f64,
}

impl KeyPair {
    /// Generates a fresh key pair with public exponent 65537.
    pub fn generate(modulus_bits: usize) -> Result<Self, AsymmetricError> {
        let private = RsaPrivateKey::new(&mut OsRng, modulus_bits)
            .map_err(|e| AsymmetricError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private, now_epoch()))
    }

    /// Wraps an existing private key.
    pub(crate) fn from_private(private: RsaPrivateKey, epoch: f64) -> Self {
        let public = PublicKey {
            inner: RsaPublicKey::from(&private),
        };
        Self {
            private,
            public,
            epoch,
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns `(modulus, exponent)` for wire transmission.
    pub fn public_parts(&self) -> (Vec<u8>, Vec<u8>) {
        self.public.to_parts()
    }

    /// Epoch identifying this key on the wire.
    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    /// Encrypts to this pair's own public key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
        self.public.encrypt(plaintext)
    }

    /// Decrypts one OAEP block with the private key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
        self.private
            .decrypt(Oaep::new::<Sha3_256>(), ciphertext)
            .map_err(|e| AsymmetricError::DecryptionFailed(e.to_string()))
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("epoch", &self.epoch)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

fn left_pad(bytes: Vec<u8>, width: usize) -> Vec<u8> {
    if bytes.len() >= width {
        return bytes;
    }
    let mut padded = vec![0u8; width - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1024-bit keys keep debug-mode tests fast.
    fn test_keypair() -> KeyPair {
        KeyPair::generate(1024).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let keypair = test_keypair();
        let ciphertext = keypair.encrypt(b"confirmation").unwrap();
        assert_eq!(ciphertext.len(), 128);
        assert_eq!(keypair.decrypt(&ciphertext).unwrap(), b"confirmation");
    }

    #[test]
    fn test_public_parts_fixed_width() {
        let keypair = test_keypair();
        let (modulus, exponent) = keypair.public_parts();
        assert_eq!(modulus.len(), 128);
        assert_eq!(exponent, vec![0x00, 0x01, 0x00, 0x01]);

        let rebuilt = PublicKey::from_parts(&modulus, &exponent).unwrap();
        assert_eq!(&rebuilt, keypair.public_key());
    }

    #[test]
    fn test_encrypt_with_rebuilt_key() {
        let keypair = test_keypair();
        let (modulus, exponent) = keypair.public_parts();
        let peer_view = PublicKey::from_parts(&modulus, &exponent).unwrap();

        let ciphertext = peer_view.encrypt(b"hello").unwrap();
        assert_eq!(keypair.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = test_keypair();
        let bob = test_keypair();
        let ciphertext = alice.encrypt(b"secret").unwrap();
        assert!(matches!(
            bob.decrypt(&ciphertext),
            Err(AsymmetricError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let keypair = test_keypair();
        let ciphertext = keypair.encrypt(b"secret").unwrap();
        assert!(keypair.decrypt(&ciphertext[..64]).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let keypair = test_keypair();
        let max = keypair.public_key().max_plaintext_len();
        assert_eq!(max, 128 - 66);

        let result = keypair.encrypt(&vec![0u8; max + 1]);
        assert!(matches!(
            result,
            Err(AsymmetricError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_small_modulus_rejected() {
        let result = PublicKey::from_parts(&[0xC5; 64], &[0, 1, 0, 1]);
        assert!(matches!(result, Err(AsymmetricError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let keypair = test_keypair();
        let debug = format!("{:?}", keypair);
        assert!(debug.contains("REDACTED"));
    }
}
