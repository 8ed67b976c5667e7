//! Accept loop and connection registry.
//!
//! The [`Server`] task is the only owner of the registry. Connections report
//! back through an event channel; the server applies those events between
//! accepts.

mod connection;
mod dispatcher;

pub use connection::{ConnectionOutcome, ConnectionSettings, ERROR_MESSAGE};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherHandle};

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::config::ServerConfig;
use crate::chat::error::ChatError;
use crate::chat::protocol::ClientInfo;
use crate::chat::service::ConnectionId;
use crate::chat::transport::TcpListener;
use crate::crypto::KeyPair;

use connection::Connection;

/// Depth of the connection-to-server event channel.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications from connection tasks.
#[derive(Debug)]
pub enum ServerEvent {
    Established {
        id: ConnectionId,
        identity: Option<ClientInfo>,
    },
    Closed {
        id: ConnectionId,
        outcome: ConnectionOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Handshaking,
    Established,
}

/// Registry entry for one live connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub phase: ConnectionPhase,
    pub identity: Option<ClientInfo>,
    task: JoinHandle<()>,
}

/// Snapshot of the registry, published after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub handshaking: usize,
    pub established: usize,
    /// Connections that have come and gone since startup.
    pub closed: usize,
}

/// The messaging server.
pub struct Server {
    listener: TcpListener,
    server_key: Arc<KeyPair>,
    dispatcher: Dispatcher,
    dispatcher_capacity: usize,
    settings: ConnectionSettings,
    stats: watch::Sender<ServerStats>,
}

impl Server {
    /// Binds the listener. Services must already be registered on `dispatcher`.
    pub async fn bind(
        config: &ServerConfig,
        server_key: KeyPair,
        dispatcher: Dispatcher,
    ) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
        let (stats, _) = watch::channel(ServerStats::default());
        tracing::info!(addr = %listener.local_addr()?, "Listening");

        Ok(Self {
            listener,
            server_key: Arc::new(server_key),
            dispatcher,
            dispatcher_capacity: config.dispatcher_capacity,
            settings: ConnectionSettings::from(config),
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        self.listener.local_addr()
    }

    /// Watches registry counts.
    pub fn stats(&self) -> watch::Receiver<ServerStats> {
        self.stats.subscribe()
    }

    /// Serves until `shutdown` resolves.
    ///
    /// On shutdown, live connections are aborted and the dispatcher is
    /// stopped. A failing `accept` is logged and does not stop the server.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            server_key,
            dispatcher,
            dispatcher_capacity,
            settings,
            stats,
        } = self;

        let (handle, dispatcher_task) = dispatcher.spawn(dispatcher_capacity);
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CAPACITY);
        let mut registry = Registry::new(stats);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let id = ConnectionId::new();
                        tracing::info!(connection = %id, peer = %peer_addr, "Accepted connection");
                        let connection = Connection {
                            id,
                            peer_addr,
                            server_key: server_key.clone(),
                            dispatcher: handle.clone(),
                            events: events_tx.clone(),
                            settings: settings.clone(),
                        };
                        let task = connection.spawn(stream);
                        registry.insert(ConnectionRecord {
                            id,
                            peer_addr,
                            phase: ConnectionPhase::Handshaking,
                            identity: None,
                            task,
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                Some(event) = events_rx.recv() => registry.apply(event),
            }
        }

        registry.abort_all();
        drop(handle);
        dispatcher_task.abort();
        Ok(())
    }
}

/// Id to record table, owned by the server task.
struct Registry {
    records: HashMap<ConnectionId, ConnectionRecord>,
    closed: usize,
    stats: watch::Sender<ServerStats>,
}

impl Registry {
    fn new(stats: watch::Sender<ServerStats>) -> Self {
        Self {
            records: HashMap::new(),
            closed: 0,
            stats,
        }
    }

    fn insert(&mut self, record: ConnectionRecord) {
        self.records.insert(record.id, record);
        self.publish();
    }

    fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Established { id, identity } => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.phase = ConnectionPhase::Established;
                    record.identity = identity;
                }
            }
            ServerEvent::Closed { id, outcome } => {
                if let Some(record) = self.records.remove(&id) {
                    tracing::debug!(
                        connection = %id,
                        peer = %record.peer_addr,
                        outcome = ?outcome,
                        "Removed connection"
                    );
                    self.closed += 1;
                }
            }
        }
        self.publish();
    }

    fn abort_all(&mut self) {
        for (_, record) in self.records.drain() {
            record.task.abort();
        }
        self.publish();
    }

    fn publish(&self) {
        let established = self
            .records
            .values()
            .filter(|r| r.phase == ConnectionPhase::Established)
            .count();
        self.stats.send_replace(ServerStats {
            handshaking: self.records.len() - established,
            established,
            closed: self.closed,
        });
    }
}
