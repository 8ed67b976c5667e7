//! # aioserver - encrypted multi-client messaging
//!
//! A small application protocol and server. Clients authenticate with RSA,
//! bootstrap a ratcheting AES-128-GCM channel, and exchange named messages
//! that the server routes to pluggable services.
//!
//! ## Overview
//!
//! - Every unit on the wire is an [`chat::protocol::Envelope`], framed with a
//!   4-byte big-endian length
//! - A five-step handshake moves from plaintext public keys to RSA-OAEP
//!   (SHA3-256) to the AES ratchet
//! - Each established connection runs a read loop and a writer task and
//!   submits decrypted requests to a single dispatcher task
//! - Services (chat room, chat bot, TUI echo) reply through a responder bound
//!   to the sending connection
//!
//! ## Example
//!
//! ```no_run
//! use aioserver::chat::server::{Dispatcher, Server};
//! use aioserver::chat::service::{ChatRoomService, CHAT_ROOM_MESSAGE};
//! use aioserver::chat::ServerConfig;
//! use aioserver::crypto::load_or_create;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::default();
//! let key = load_or_create(&config.key_path, None, config.modulus_bits)?;
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register(CHAT_ROOM_MESSAGE, Box::new(ChatRoomService::new()))?;
//!
//! let server = Server::bind(&config, key, dispatcher).await?;
//! server.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: RSA key pairs, key persistence, the AES ratchet
//! - [`chat`]: envelopes, handshake, transport, server, services, client

pub mod chat;
pub mod crypto;

// Re-export commonly used types at the crate root
pub use chat::{ChatError, Client, ClientConfig, Server, ServerConfig};
pub use crypto::{KeyPair, Ratchet};
