//! # Messaging layer
//!
//! Clients reach the server over framed TCP, bootstrap an AES ratchet through
//! a five-step RSA handshake, and then exchange named messages that the
//! server routes to services.
//!
//! ## Pieces
//!
//! - [`protocol`]: envelopes and the handshake state machines
//! - [`transport`]: length-prefixed framing over TCP
//! - [`server`]: accept loop, connection actors, dispatcher
//! - [`service`]: the service contract and the built-in services
//! - [`Client`]: the other end of a connection

mod client;
mod config;
mod error;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{Client, ClientMessage, ClientReceiver, ClientSender};
pub use config::{
    config_dir, default_key_path, ClientConfig, ServerConfig, DEFAULT_BIND_ADDR,
    DEFAULT_MAX_FRAME_LEN, DEFAULT_SERVER_ADDR,
};
pub use error::ChatError;
pub use server::{
    ConnectionOutcome, ConnectionPhase, ConnectionRecord, Dispatcher, Server, ServerEvent,
    ServerStats,
};
