//! Per-socket connection actor.
//!
//! A connection first drives the server handshake over the whole stream.
//! Once established, the stream is split: a writer task owns the outbound
//! ratchet and drains the connection's queue, while the read loop owns the
//! inbound ratchet and feeds the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::chat::config::{
    ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_MAX_CONSECUTIVE_FAILURES,
    DEFAULT_MAX_FRAME_LEN, DEFAULT_OUTBOUND_CAPACITY,
};
use crate::chat::error::ChatError;
use crate::chat::protocol::{
    Body, ClientInfo, Envelope, ErrorInfo, HandshakeAction, SecureChannel, ServerHandshake,
    AUTHENTICATOR,
};
use crate::chat::server::dispatcher::DispatcherHandle;
use crate::chat::server::ServerEvent;
use crate::chat::service::{ConnectionId, Outbound, Responder, ServiceRequest};
use crate::chat::transport::{EnvelopeReader, EnvelopeWriter, MessageTransport, TcpConnection};
use crate::crypto::{now_epoch, KeyPair, Ratchet};

/// Message name used on error replies to frames that could not be decoded.
pub const ERROR_MESSAGE: &str = "Error";

/// Per-connection limits, taken from [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_frame_len: usize,
    pub handshake_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub outbound_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_frame_len: config.max_frame_len,
            handshake_timeout: config.handshake_timeout(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The peer hung up between frames.
    Closed,
    /// The connection was dropped because of a protocol or transport error.
    Faulted(String),
}

/// State carried from the handshake into the established phase.
struct Session {
    channel: SecureChannel,
    identity: Option<ClientInfo>,
    epoch: f64,
}

/// Consecutive failure counter shared by both phases.
struct Failures {
    count: u32,
    max: u32,
}

impl Failures {
    fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    /// Counts one failure. Errors once the limit is reached.
    fn record(&mut self, error: &ChatError) -> Result<(), ConnectionOutcome> {
        self.count += 1;
        if self.count >= self.max {
            return Err(ConnectionOutcome::Faulted(format!(
                "{} consecutive failures, last: {}",
                self.count, error
            )));
        }
        Ok(())
    }
}

fn error_envelope(epoch: f64, message_name: &str, error: &ChatError) -> Envelope {
    Envelope::error_reply(epoch, message_name, ErrorInfo::from(error))
}

/// One accepted socket and everything it needs to serve it.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) server_key: Arc<KeyPair>,
    pub(crate) dispatcher: DispatcherHandle,
    pub(crate) events: mpsc::Sender<ServerEvent>,
    pub(crate) settings: ConnectionSettings,
}

impl Connection {
    /// Runs the connection in its own task and reports its end to the server.
    pub(crate) fn spawn(self, stream: TcpStream) -> JoinHandle<()> {
        let span = tracing::info_span!("connection", id = %self.id, peer = %self.peer_addr);
        tokio::spawn(
            async move {
                let id = self.id;
                let events = self.events.clone();
                let outcome = self.run(stream).await;
                match &outcome {
                    ConnectionOutcome::Closed => tracing::info!("Connection closed"),
                    ConnectionOutcome::Faulted(reason) => {
                        tracing::warn!(reason = %reason, "Connection faulted")
                    }
                }
                let _ = events.send(ServerEvent::Closed { id, outcome }).await;
            }
            .instrument(span),
        )
    }

    async fn run(self, stream: TcpStream) -> ConnectionOutcome {
        let mut transport = TcpConnection::new(stream, self.settings.max_frame_len);

        let session = match self.handshake(&mut transport).await {
            Ok(session) => session,
            Err(outcome) => {
                let _ = transport.close().await;
                return outcome;
            }
        };

        tracing::info!(user = ?session.identity, "Session established");
        let _ = self
            .events
            .send(ServerEvent::Established {
                id: self.id,
                identity: session.identity.clone(),
            })
            .await;

        let (reader, writer) = transport.into_split();
        self.serve(reader, writer, session).await
    }

    /// Drives the server handshake until the session is up.
    async fn handshake<T: MessageTransport>(
        &self,
        transport: &mut T,
    ) -> Result<Session, ConnectionOutcome> {
        let mut handshake = ServerHandshake::new(self.server_key.clone());
        let mut failures = Failures::new(self.settings.max_consecutive_failures);

        loop {
            let received =
                tokio::time::timeout(self.settings.handshake_timeout, transport.receive()).await;
            let result = match received {
                Err(_) => {
                    return Err(ConnectionOutcome::Faulted(format!(
                        "handshake idle for {:?} in {:?}",
                        self.settings.handshake_timeout,
                        handshake.state()
                    )))
                }
                Ok(Err(ChatError::ConnectionClosed)) => return Err(ConnectionOutcome::Closed),
                Ok(Err(e)) => Err(e),
                Ok(Ok(envelope)) => handshake.handle(&envelope),
            };

            match result {
                Ok(HandshakeAction::Send(reply)) => {
                    failures.reset();
                    transport.send(&reply).await.map_err(fault)?;
                }
                Ok(HandshakeAction::Established { reply, channel }) => {
                    if let Some(reply) = reply {
                        transport.send(&reply).await.map_err(fault)?;
                    }
                    return Ok(Session {
                        channel,
                        identity: handshake.identity().cloned(),
                        epoch: handshake.client_epoch().unwrap_or_default(),
                    });
                }
                Err(e) => {
                    tracing::warn!(state = ?handshake.state(), error = %e, "Handshake message rejected");
                    let epoch = handshake.client_epoch().unwrap_or_else(now_epoch);
                    // The stream may already be gone; the outcome below is what matters.
                    let _ = transport.send(&error_envelope(epoch, AUTHENTICATOR, &e)).await;
                    if !e.is_recoverable() {
                        return Err(fault(e));
                    }
                    failures.record(&e)?;
                }
            }
        }
    }

    /// Established phase: writer task plus read loop.
    async fn serve<R, W>(
        &self,
        reader: EnvelopeReader<R>,
        writer: EnvelopeWriter<W>,
        session: Session,
    ) -> ConnectionOutcome
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            channel,
            identity,
            epoch,
        } = session;
        let SecureChannel { outbound, inbound } = channel;

        let (tx, rx) = mpsc::channel(self.settings.outbound_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let writer_task = tokio::spawn(
            write_loop(writer, outbound, rx, stop_rx, epoch).in_current_span(),
        );

        let responder = Responder::new(self.id, tx);
        let outcome = self
            .read_loop(reader, inbound, &responder, identity, epoch)
            .await;
        drop(responder);
        let _ = stop_tx.send(());

        match writer_task.await {
            Ok(Ok(())) => outcome,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Writer stopped with error");
                match outcome {
                    ConnectionOutcome::Closed => ConnectionOutcome::Faulted(e.to_string()),
                    faulted => faulted,
                }
            }
            Err(e) => ConnectionOutcome::Faulted(format!("writer task failed: {}", e)),
        }
    }

    async fn read_loop<R>(
        &self,
        mut reader: EnvelopeReader<R>,
        mut ratchet: Ratchet,
        responder: &Responder,
        identity: Option<ClientInfo>,
        epoch: f64,
    ) -> ConnectionOutcome
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut failures = Failures::new(self.settings.max_consecutive_failures);

        loop {
            let (message_name, result) = match reader.receive().await {
                Ok(envelope) => {
                    let name = envelope.message_name.clone();
                    let result = self
                        .on_envelope(envelope, &mut ratchet, responder, &identity, epoch)
                        .await;
                    (name, result)
                }
                Err(ChatError::ConnectionClosed) => return ConnectionOutcome::Closed,
                Err(e) => (ERROR_MESSAGE.to_string(), Err(e)),
            };

            let error = match result {
                Ok(()) => {
                    failures.reset();
                    continue;
                }
                Err(ChatError::DispatcherStopped) => {
                    return ConnectionOutcome::Faulted("dispatcher stopped".to_string())
                }
                Err(e) => e,
            };

            tracing::warn!(message_name = %message_name, error = %error, "Message rejected");
            let _ = responder
                .reply_error(message_name, ErrorInfo::from(&error))
                .await;
            if !error.is_recoverable() {
                return fault(error);
            }
            if let Err(outcome) = failures.record(&error) {
                return outcome;
            }
        }
    }

    /// Opens one established-phase envelope and submits it to the dispatcher.
    async fn on_envelope(
        &self,
        envelope: Envelope,
        ratchet: &mut Ratchet,
        responder: &Responder,
        identity: &Option<ClientInfo>,
        epoch: f64,
    ) -> Result<(), ChatError> {
        if let Some(error) = &envelope.error {
            tracing::warn!(code = ?error.code, details = %error.details, "Peer reported an error");
            return Ok(());
        }

        let (ciphertext, tag) = match envelope.body {
            Body::Aes { ciphertext, tag } => (ciphertext, tag),
            other => {
                return Err(ChatError::sequence(
                    "AES envelope",
                    format!("{:?} envelope", other.mode()),
                ))
            }
        };
        if envelope.encryption_timestamp != epoch {
            return Err(ChatError::sequence(
                format!("key epoch {}", epoch),
                format!("key epoch {}", envelope.encryption_timestamp),
            ));
        }

        let payload = ratchet.open(&ciphertext, &tag)?;
        tracing::debug!(message_name = %envelope.message_name, len = payload.len(), "Message received");

        self.dispatcher
            .submit(ServiceRequest {
                origin: self.id,
                message_name: envelope.message_name,
                payload,
                client_info: identity.clone().or(envelope.client_info),
                responder: responder.clone(),
            })
            .await
    }
}

fn fault<E: std::fmt::Display>(error: E) -> ConnectionOutcome {
    ConnectionOutcome::Faulted(error.to_string())
}

/// Seals queued replies and writes them until told to stop.
///
/// After the stop signal, whatever is already queued is still flushed.
async fn write_loop<W>(
    mut writer: EnvelopeWriter<W>,
    mut ratchet: Ratchet,
    mut rx: mpsc::Receiver<Outbound>,
    mut stop: oneshot::Receiver<()>,
    epoch: f64,
) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(outbound) => write_outbound(&mut writer, &mut ratchet, outbound, epoch).await?,
                None => break,
            },
            _ = &mut stop => {
                while let Ok(outbound) = rx.try_recv() {
                    write_outbound(&mut writer, &mut ratchet, outbound, epoch).await?;
                }
                break;
            }
        }
    }
    writer.close().await
}

async fn write_outbound<W>(
    writer: &mut EnvelopeWriter<W>,
    ratchet: &mut Ratchet,
    outbound: Outbound,
    epoch: f64,
) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin + Send,
{
    let envelope = match outbound {
        Outbound::Message {
            message_name,
            payload,
        } => {
            let sealed = ratchet.seal(&payload)?;
            Envelope::aes(epoch, message_name, sealed.ciphertext, sealed.tag)
        }
        Outbound::Error {
            message_name,
            error,
        } => Envelope::error_reply(epoch, message_name, error),
    };
    writer.send(&envelope).await
}
