//! aioserver - encrypted multi-client messaging
//!
//! Runs the server, a line-oriented chat client, or manages the server key.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{CommandExecutor, ConnectCommand, KeygenCommand, ServeCommand};

/// aioserver - encrypted multi-client messaging
///
/// Clients authenticate with RSA, then talk over a ratcheting AES-128-GCM
/// channel to services hosted by the server.
#[derive(Parser)]
#[command(name = "aioserver")]
#[command(version)]
#[command(about = "Encrypted multi-client messaging server and client")]
struct Cli {
    /// Config file (server.toml for serve/keygen, client.toml for connect)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServeCommand),

    /// Join the chat room from the terminal
    Connect(ConnectCommand),

    /// Create or inspect the server key
    Keygen(KeygenCommand),
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aioserver=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(mut cmd) => {
            cmd.config = cli.config;
            cmd.execute()
        }
        Commands::Connect(mut cmd) => {
            cmd.config = cli.config;
            cmd.execute()
        }
        Commands::Keygen(mut cmd) => {
            cmd.config = cli.config;
            cmd.execute()
        }
    }
}
