//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod connect;
mod keygen;
mod serve;

pub use connect::ConnectCommand;
pub use keygen::KeygenCommand;
pub use serve::ServeCommand;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use aioserver::chat::ServerConfig;
use aioserver::crypto::MIN_MODULUS_BITS;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Loads the server config from `path`, or from the default location.
pub(crate) fn load_server_config(path: Option<&Path>) -> Result<ServerConfig> {
    let path: PathBuf = match path {
        Some(path) => path.to_path_buf(),
        None => ServerConfig::config_path()?,
    };
    ServerConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Rejects a modulus clients would refuse during the handshake.
pub(crate) fn ensure_modulus_bits(bits: usize) -> Result<()> {
    if bits < MIN_MODULUS_BITS {
        bail!(
            "Modulus must be at least {} bits, got {}",
            MIN_MODULUS_BITS,
            bits
        );
    }
    Ok(())
}

/// Prompt for a passphrase (input hidden).
pub(crate) fn prompt_passphrase(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passphrase")
}

/// Builds the runtime the async commands run on.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}
