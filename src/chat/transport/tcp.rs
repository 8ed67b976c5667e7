//! TCP transport for chat connections.
//!
//! The handshake runs over a whole [`TcpConnection`]. Once a session is
//! established the connection is split so that reading and writing can
//! proceed in separate tasks.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};

use crate::chat::error::ChatError;
use crate::chat::protocol::Envelope;
use crate::chat::transport::{EnvelopeReader, EnvelopeWriter, MessageTransport};

/// TCP connection wrapper using tokio.
pub struct TcpConnection {
    reader: EnvelopeReader<ReadHalf<TcpStream>>,
    writer: EnvelopeWriter<WriteHalf<TcpStream>>,
}

impl TcpConnection {
    /// Create a new TCP connection from a stream.
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: EnvelopeReader::new(read_half, max_frame_len),
            writer: EnvelopeWriter::new(write_half, max_frame_len),
        }
    }

    /// Connect to a remote address.
    pub async fn connect<A: ToSocketAddrs>(addr: A, max_frame_len: usize) -> Result<Self, ChatError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChatError::TransportError(format!("Failed to connect: {}", e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, max_frame_len))
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(
        self,
    ) -> (
        EnvelopeReader<ReadHalf<TcpStream>>,
        EnvelopeWriter<WriteHalf<TcpStream>>,
    ) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl MessageTransport for TcpConnection {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        self.writer.send(envelope).await
    }

    async fn receive(&mut self) -> Result<Envelope, ChatError> {
        self.reader.receive().await
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.close().await
    }
}

/// TCP listener for accepting chat connections using tokio.
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    /// Bind to an address and start listening.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ChatError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| ChatError::TransportError(format!("Failed to bind: {}", e)))?;
        Ok(Self { listener })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ChatError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChatError::TransportError(format!("Failed to accept: {}", e)))?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Get the local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        self.listener
            .local_addr()
            .map_err(|e| ChatError::TransportError(format!("Failed to get local addr: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::ClientInfo;

    const MAX: usize = 64 * 1024;

    #[tokio::test]
    async fn test_tcp_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut conn = TcpConnection::connect(addr, MAX).await.unwrap();

            let msg = Envelope::plaintext(1.0, "TUIMessage", vec![1, 2, 3])
                .with_client_info(ClientInfo::new("dave"));
            conn.send(&msg).await.unwrap();

            let response = conn.receive().await.unwrap();
            assert_eq!(response.message_name, "response");

            conn.close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut server_conn = TcpConnection::new(stream, MAX);

        let msg = server_conn.receive().await.unwrap();
        assert_eq!(msg.message_name, "TUIMessage");
        assert_eq!(msg.client_info, Some(ClientInfo::new("dave")));

        let response = Envelope::rsa(1.0, "response", vec![4, 5, 6]);
        server_conn.send(&response).await.unwrap();

        client_task.await.unwrap();
        assert!(matches!(
            server_conn.receive().await,
            Err(ChatError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_multiple_messages_after_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let conn = TcpConnection::connect(addr, MAX).await.unwrap();
            let (_reader, mut writer) = conn.into_split();

            for i in 0..10u8 {
                let msg = Envelope::aes(2.0, format!("msg{}", i), vec![i], vec![0; 16]);
                writer.send(&msg).await.unwrap();
            }

            writer.close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = TcpConnection::new(stream, MAX).into_split();

        for i in 0..10 {
            let msg = reader.receive().await.unwrap();
            assert_eq!(msg.message_name, format!("msg{}", i));
        }

        client_task.await.unwrap();
    }
}
