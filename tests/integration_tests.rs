//! Integration tests for aioserver
//!
//! Every test starts a real server on a loopback port and talks to it with
//! the public client.
//!
//! Keys are 1024-bit to keep debug builds fast.

use std::future::Future;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use aioserver::chat::protocol::{Envelope, ErrorCode};
use aioserver::chat::server::{Dispatcher, Server, ServerStats};
use aioserver::chat::service::{
    ChatBotService, ChatMessage, ChatRoomService, TuiMessage, TuiService, CHAT_BOT_MESSAGE,
    CHAT_ROOM_MESSAGE, START_SENTINEL, TUI_MESSAGE,
};
use aioserver::chat::{ChatError, Client, ClientConfig, ClientMessage, ServerConfig};
use aioserver::crypto::{load_or_create, KeyPair};

const BITS: usize = 1024;
const MAX_FRAME: usize = 1024 * 1024;

struct TestServer {
    addr: String,
    stats: watch::Receiver<ServerStats>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ChatError>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            key_path: dir.path().join("server_key.hex"),
            modulus_bits: BITS,
            ..Default::default()
        };
        let key = load_or_create(&config.key_path, None, config.modulus_bits).unwrap();

        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(CHAT_ROOM_MESSAGE, Box::new(ChatRoomService::new()))
            .unwrap();
        dispatcher
            .register(CHAT_BOT_MESSAGE, Box::new(ChatBotService::new(config.history_len)))
            .unwrap();
        dispatcher.register(TUI_MESSAGE, Box::new(TuiService)).unwrap();

        let server = Server::bind(&config, key, dispatcher).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let stats = server.stats();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        Self {
            addr,
            stats,
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    async fn client(&self, username: &str) -> (Client, f64) {
        let key = KeyPair::generate(BITS).unwrap();
        let epoch = key.epoch();
        let client = within(Client::connect_with_key(&self.addr, username, key, MAX_FRAME))
            .await
            .unwrap();
        (client, epoch)
    }

    async fn wait_for(&mut self, check: impl FnMut(&ServerStats) -> bool) {
        within(self.stats.wait_for(check)).await.unwrap();
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        within(self.task).await.unwrap().unwrap();
    }
}

/// Fails the test instead of hanging.
async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(20), future)
        .await
        .expect("timed out")
}

async fn say(client: &mut Client, channel: &str, line: &str) {
    let payload = ChatMessage::new(client.username().to_string(), line)
        .to_bytes()
        .unwrap();
    client.send(channel, &payload).await.unwrap();
}

async fn hear(client: &mut Client) -> ChatMessage {
    let ClientMessage { payload, .. } = within(client.recv()).await.unwrap();
    ChatMessage::from_bytes(&payload).unwrap()
}

async fn tui_echo(client: &mut Client, text: &str) -> String {
    let payload = TuiMessage::new(text).to_bytes().unwrap();
    client.send(TUI_MESSAGE, &payload).await.unwrap();
    let reply = within(client.recv()).await.unwrap();
    assert_eq!(reply.message_name, TUI_MESSAGE);
    TuiMessage::from_bytes(&reply.payload).unwrap().text
}

fn remote_code(result: Result<ClientMessage, ChatError>) -> ErrorCode {
    match result {
        Err(ChatError::Remote { code, .. }) => code,
        other => panic!("expected an error reply, got {:?}", other),
    }
}

/// Handshake over real TCP reaches Established on both sides
#[tokio::test]
async fn test_handshake_establishes_both_sides() {
    let mut server = TestServer::start().await;
    let (mut client, _) = server.client("alice").await;

    server.wait_for(|s| s.established == 1).await;
    assert_eq!(client.username(), "alice");
    assert_eq!(tui_echo(&mut client, "ping").await, "ping");

    server.shutdown().await;
}

/// Connecting through a ClientConfig
#[tokio::test]
async fn test_connect_with_config() {
    let mut server = TestServer::start().await;
    let config = ClientConfig {
        server_addr: server.addr.clone(),
        username: "carol".to_string(),
        modulus_bits: BITS,
        ..Default::default()
    };

    let mut client = within(Client::connect(&config)).await.unwrap();
    server.wait_for(|s| s.established == 1).await;
    assert_eq!(tui_echo(&mut client, "hi").await, "hi");

    server.shutdown().await;
}

/// A client without a username is refused before any I/O
#[tokio::test]
async fn test_connect_requires_username() {
    let config = ClientConfig {
        modulus_bits: BITS,
        ..Default::default()
    };
    assert!(matches!(
        Client::connect(&config).await,
        Err(ChatError::ConfigError(_))
    ));
}

/// Two chat room clients both see a message from either
#[tokio::test]
async fn test_chat_room_broadcast() {
    let mut server = TestServer::start().await;
    let (mut alice, _) = server.client("alice").await;
    let (mut bob, _) = server.client("bob").await;
    server.wait_for(|s| s.established == 2).await;

    say(&mut alice, CHAT_ROOM_MESSAGE, START_SENTINEL).await;
    assert_eq!(hear(&mut alice).await.message, "alice has connected!");

    say(&mut bob, CHAT_ROOM_MESSAGE, START_SENTINEL).await;
    assert_eq!(hear(&mut alice).await.message, "bob has connected!");
    assert_eq!(hear(&mut bob).await.message, "bob has connected!");

    say(&mut alice, CHAT_ROOM_MESSAGE, "hello room").await;
    for client in [&mut alice, &mut bob] {
        let message = hear(client).await;
        assert_eq!(message.author, "alice");
        assert_eq!(message.message, "hello room");
        assert!(message.timestamp > 0.0);
    }

    server.shutdown().await;
}

/// The chat bot replays its history to a late subscriber
#[tokio::test]
async fn test_chat_bot_history() {
    let mut server = TestServer::start().await;
    let (mut alice, _) = server.client("alice").await;

    say(&mut alice, CHAT_BOT_MESSAGE, START_SENTINEL).await;
    say(&mut alice, CHAT_BOT_MESSAGE, "first").await;
    say(&mut alice, CHAT_BOT_MESSAGE, "second").await;
    assert_eq!(hear(&mut alice).await.message, "first");
    assert_eq!(hear(&mut alice).await.message, "second");

    let (mut bob, _) = server.client("bob").await;
    say(&mut bob, CHAT_BOT_MESSAGE, START_SENTINEL).await;
    assert_eq!(hear(&mut bob).await.message, "first");
    assert_eq!(hear(&mut bob).await.message, "second");

    server.shutdown().await;
}

/// Many messages in both directions force key rotation on both ratchets
#[tokio::test]
async fn test_long_session_survives_rotation() {
    let server = TestServer::start().await;
    let (mut client, _) = server.client("dave").await;

    for i in 0..50 {
        let text = format!("line {}", i);
        assert_eq!(tui_echo(&mut client, &text).await, text);
    }

    server.shutdown().await;
}

/// A message for an unregistered service is dropped and the connection lives on
#[tokio::test]
async fn test_unknown_service_dropped() {
    let server = TestServer::start().await;
    let (mut client, _) = server.client("erin").await;

    client.send("NoSuchService", b"ignored").await.unwrap();
    assert_eq!(tui_echo(&mut client, "still here").await, "still here");

    server.shutdown().await;
}

/// A forged AES frame gets an error reply and does not desync the session
#[tokio::test]
async fn test_bad_tag_gets_error_reply() {
    let server = TestServer::start().await;
    let (mut client, epoch) = server.client("frank").await;

    let forged = Envelope::aes(epoch, TUI_MESSAGE, vec![1, 2, 3], vec![0; 16]);
    client.send_envelope(&forged).await.unwrap();
    assert_eq!(
        remote_code(within(client.recv()).await),
        ErrorCode::AuthenticationFailed
    );

    assert_eq!(tui_echo(&mut client, "after").await, "after");

    server.shutdown().await;
}

/// Repeated bad frames fault the connection
#[tokio::test]
async fn test_repeated_failures_close_connection() {
    let mut server = TestServer::start().await;
    let (mut client, epoch) = server.client("grace").await;

    for _ in 0..3 {
        let forged = Envelope::aes(epoch, TUI_MESSAGE, vec![9; 8], vec![0; 16]);
        client.send_envelope(&forged).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(
            remote_code(within(client.recv()).await),
            ErrorCode::AuthenticationFailed
        );
    }
    assert!(matches!(
        within(client.recv()).await,
        Err(ChatError::ConnectionClosed)
    ));

    server.wait_for(|s| s.closed == 1 && s.established == 0).await;
    server.shutdown().await;
}

/// Plaintext after the handshake is a sequence violation
#[tokio::test]
async fn test_plaintext_after_handshake_rejected() {
    let mut server = TestServer::start().await;
    let (mut client, epoch) = server.client("heidi").await;

    let plain = Envelope::plaintext(epoch, TUI_MESSAGE, b"in the clear".to_vec());
    client.send_envelope(&plain).await.unwrap();
    assert_eq!(
        remote_code(within(client.recv()).await),
        ErrorCode::ProtocolSequence
    );
    assert!(matches!(
        within(client.recv()).await,
        Err(ChatError::ConnectionClosed)
    ));

    server.wait_for(|s| s.closed == 1).await;
    server.shutdown().await;
}

/// Disconnecting removes the connection from the registry
#[tokio::test]
async fn test_disconnect_removes_record() {
    let mut server = TestServer::start().await;
    let (mut client, _) = server.client("ivan").await;
    server.wait_for(|s| s.established == 1).await;

    client.close().await.unwrap();
    drop(client);

    server
        .wait_for(|s| s.established == 0 && s.handshaking == 0 && s.closed == 1)
        .await;
    server.shutdown().await;
}

/// A second server start reuses the persisted key
#[tokio::test]
async fn test_server_key_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("server_key.hex");

    let first = load_or_create(&path, Some("secret"), BITS).unwrap();
    let second = load_or_create(&path, Some("secret"), BITS).unwrap();
    assert_eq!(first.public_key(), second.public_key());
}
