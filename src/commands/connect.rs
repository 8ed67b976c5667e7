//! Line-oriented chat client.
//!
//! Reads lines from stdin and prints what the channel broadcasts. Type
//! `/quit` or close stdin to leave.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use aioserver::chat::service::{
    ChatMessage, CHAT_BOT_MESSAGE, CHAT_ROOM_MESSAGE, START_SENTINEL, STOP_SENTINEL,
};
use aioserver::chat::{ChatError, Client, ClientConfig, ClientReceiver, ClientSender};

use super::{runtime, CommandExecutor};

/// Join the chat room (or the chat bot channel) on a server.
#[derive(Args, Debug)]
pub struct ConnectCommand {
    /// Server address (overrides server_addr)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Name shown to other users (overrides username)
    #[arg(short, long)]
    pub username: Option<String>,

    /// Use the chat bot channel, which replays recent history
    #[arg(long)]
    pub bot: bool,

    #[arg(skip)]
    pub config: Option<PathBuf>,
}

impl CommandExecutor for ConnectCommand {
    fn execute(&self) -> Result<()> {
        let config = self.client_config()?;
        if config.username.trim().is_empty() {
            bail!("A username is required (--username or username in the client config)");
        }
        let channel = if self.bot {
            CHAT_BOT_MESSAGE
        } else {
            CHAT_ROOM_MESSAGE
        };

        let rt = runtime()?;
        rt.block_on(async {
            eprintln!("Connecting to {} as {}...", config.server_addr, config.username);
            let client = Client::connect(&config)
                .await
                .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
            let (mut sender, receiver) = client.into_split();
            eprintln!("Connected. Type /quit to leave.");

            send_line(&mut sender, channel, &config.username, START_SENTINEL).await?;

            let mut printer = tokio::spawn(print_incoming(receiver));
            tokio::select! {
                result = read_stdin(&mut sender, channel, &config.username) => result?,
                _ = &mut printer => eprintln!("Server closed the connection."),
            }

            let _ = send_line(&mut sender, channel, &config.username, STOP_SENTINEL).await;
            let _ = sender.close().await;
            printer.abort();
            Ok::<(), anyhow::Error>(())
        })
    }
}

impl ConnectCommand {
    fn client_config(&self) -> Result<ClientConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => ClientConfig::config_path()?,
        };
        let mut config = ClientConfig::load(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        if let Some(server) = &self.server {
            config.server_addr = server.clone();
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        Ok(config)
    }
}

async fn send_line(
    sender: &mut ClientSender,
    channel: &str,
    username: &str,
    line: &str,
) -> Result<()> {
    let payload = ChatMessage::new(username, line).to_bytes()?;
    sender.send(channel, &payload).await?;
    Ok(())
}

async fn read_stdin(sender: &mut ClientSender, channel: &str, username: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if !line.is_empty() {
            send_line(sender, channel, username, line).await?;
        }
    }
    Ok(())
}

async fn print_incoming(mut receiver: ClientReceiver) {
    loop {
        match receiver.recv().await {
            Ok(message) => match ChatMessage::from_bytes(&message.payload) {
                Ok(chat) => println!("[{}] {}", chat.author, chat.message),
                Err(_) => println!("<{} message, {} bytes>", message.message_name, message.payload.len()),
            },
            Err(ChatError::Remote { code, details }) => {
                eprintln!("Server error ({:?}): {}", code, details);
            }
            Err(ChatError::ConnectionClosed) => return,
            Err(e) => {
                eprintln!("Receive failed: {}", e);
                return;
            }
        }
    }
}
