//! Server command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use aioserver::chat::server::{Dispatcher, Server};
use aioserver::chat::service::{
    ChatBotService, ChatRoomService, TuiService, CHAT_BOT_MESSAGE, CHAT_ROOM_MESSAGE, TUI_MESSAGE,
};
use aioserver::crypto::load_or_create;

use super::{ensure_modulus_bits, load_server_config, prompt_passphrase, runtime, CommandExecutor};

/// Run the messaging server until Ctrl-C.
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Listen address (overrides bind_addr)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Server key file (overrides key_path)
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Prompt for the key file passphrase
    #[arg(long)]
    pub ask_passphrase: bool,

    /// Chat bot history length (overrides history_len)
    #[arg(long)]
    pub history: Option<usize>,

    #[arg(skip)]
    pub config: Option<PathBuf>,
}

impl CommandExecutor for ServeCommand {
    fn execute(&self) -> Result<()> {
        let mut config = load_server_config(self.config.as_deref())?;
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(key) = &self.key {
            config.key_path = key.clone();
        }
        if let Some(history) = self.history {
            config.history_len = history;
        }
        if self.ask_passphrase {
            config.key_passphrase = Some(prompt_passphrase("Key passphrase: ")?);
        }

        ensure_modulus_bits(config.modulus_bits)?;

        let keypair = load_or_create(
            &config.key_path,
            config.key_passphrase.as_deref(),
            config.modulus_bits,
        )
        .with_context(|| format!("Failed to load server key {}", config.key_path.display()))?;
        ensure_modulus_bits(keypair.public_key().modulus_bits())
            .with_context(|| format!("Server key {} is too small", config.key_path.display()))?;

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(CHAT_ROOM_MESSAGE, Box::new(ChatRoomService::new()))?;
        dispatcher.register(
            CHAT_BOT_MESSAGE,
            Box::new(ChatBotService::new(config.history_len)),
        )?;
        dispatcher.register(TUI_MESSAGE, Box::new(TuiService))?;

        let rt = runtime()?;
        rt.block_on(async {
            let server = Server::bind(&config, keypair, dispatcher)
                .await
                .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
            println!("Listening on {}", server.local_addr()?);

            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    }
}
