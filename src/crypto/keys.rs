//! Persistence for the server's long-lived RSA key.
//!
//! The key is stored as hex text wrapping a PKCS#8 DER document. With a
//! passphrase the document is PKCS#8-encrypted (PBES2).

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use thiserror::Error;

use super::asymmetric::{now_epoch, AsymmetricError, KeyPair};

/// Errors that can occur while loading or saving keys.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid key encoding: {0}")]
    Encoding(String),

    #[error("Key generation failed: {0}")]
    Generation(#[from] AsymmetricError),
}

/// Loads the key at `path`, or generates and persists a new one.
///
/// A missing or unparseable file is replaced with a fresh key. A wrong
/// passphrase counts as unparseable. Any other I/O failure is returned.
pub fn load_or_create(
    path: &Path,
    passphrase: Option<&str>,
    modulus_bits: usize,
) -> Result<KeyPair, KeyError> {
    match fs::read_to_string(path) {
        Ok(text) => match decode_private_key(&text, passphrase) {
            Ok(private) => {
                tracing::debug!(path = %path.display(), "Loaded server key");
                return Ok(KeyPair::from_private(private, file_epoch(path)));
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Stored key is unreadable, generating a new one"
                );
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No server key found, generating one");
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            tracing::warn!(path = %path.display(), "Stored key is not text, generating a new one");
        }
        Err(e) => return Err(KeyError::Io(e)),
    }

    let keypair = KeyPair::generate(modulus_bits)?;
    save_private_key(path, &keypair, passphrase)?;
    Ok(keypair)
}

/// Writes the private key to `path` with owner-only permissions.
pub fn save_private_key(
    path: &Path,
    keypair: &KeyPair,
    passphrase: Option<&str>,
) -> Result<(), KeyError> {
    let encoded = encode_private_key(keypair.private_key(), passphrase)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = open_private(path)?;
    file.write_all(encoded.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Opens `path` for writing, owner-only from the moment it exists.
#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation; tighten a file that already existed
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Hex-encodes a PKCS#8 DER private key, encrypted when a passphrase is set.
pub fn encode_private_key(
    private: &RsaPrivateKey,
    passphrase: Option<&str>,
) -> Result<String, KeyError> {
    let document = match passphrase {
        Some(passphrase) => private.to_pkcs8_encrypted_der(&mut OsRng, passphrase),
        None => private.to_pkcs8_der(),
    }
    .map_err(|e| KeyError::Encoding(e.to_string()))?;

    Ok(hex::encode(document.as_bytes()))
}

/// Parses the hex-wrapped PKCS#8 produced by [`encode_private_key`].
pub fn decode_private_key(
    text: &str,
    passphrase: Option<&str>,
) -> Result<RsaPrivateKey, KeyError> {
    let der = hex::decode(text.trim()).map_err(|e| KeyError::Encoding(e.to_string()))?;

    match passphrase {
        Some(passphrase) => RsaPrivateKey::from_pkcs8_encrypted_der(&der, passphrase),
        None => RsaPrivateKey::from_pkcs8_der(&der),
    }
    .map_err(|e| KeyError::Encoding(e.to_string()))
}

/// Key epoch for a stored key: its file modification time.
fn file_epoch(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_else(now_epoch)
}
