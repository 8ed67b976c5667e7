//! Server key command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use aioserver::crypto::load_or_create;

use super::{ensure_modulus_bits, load_server_config, prompt_passphrase, CommandExecutor};

/// Create the server key, or load and describe an existing one.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Key file (defaults to the configured key_path)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Modulus size for a new key
    #[arg(long)]
    pub bits: Option<usize>,

    /// Prompt for a passphrase to encrypt the key file
    #[arg(long)]
    pub ask_passphrase: bool,

    #[arg(skip)]
    pub config: Option<PathBuf>,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let config = load_server_config(self.config.as_deref())?;
        let path = self.output.clone().unwrap_or(config.key_path);
        let bits = self.bits.unwrap_or(config.modulus_bits);
        ensure_modulus_bits(bits)?;

        let passphrase = if self.ask_passphrase {
            Some(prompt_passphrase("Key passphrase: ")?)
        } else {
            config.key_passphrase
        };

        let keypair = load_or_create(&path, passphrase.as_deref(), bits)
            .with_context(|| format!("Failed to load or create {}", path.display()))?;

        println!("Server key ready:");
        println!();
        println!("  Path:    {}", path.display());
        println!("  Modulus: {} bits", keypair.public_key().modulus_bits());
        println!("  Epoch:   {}", keypair.epoch());
        println!();
        println!("Keep this file private. Deleting it rotates the server key.");

        Ok(())
    }
}
