//! Transport layer for chat connections.
//!
//! Every envelope travels as one frame: a 4-byte big-endian length followed
//! by the encoded envelope.

mod tcp;

pub use tcp::{TcpConnection, TcpListener};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::chat::error::ChatError;
use crate::chat::protocol::Envelope;

/// Trait for bidirectional async envelope transport.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send an envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChatError>;

    /// Receive an envelope.
    ///
    /// Returns [`ChatError::ConnectionClosed`] when the peer hangs up between
    /// frames, and [`ChatError::MalformedEnvelope`] for a well-framed but
    /// undecodable envelope (the stream stays usable).
    async fn receive(&mut self) -> Result<Envelope, ChatError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), ChatError>;
}

/// Helper to write a length-prefixed frame asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    max_len: usize,
) -> Result<(), ChatError> {
    if data.len() > max_len || data.len() > u32::MAX as usize {
        return Err(ChatError::FrameTooLarge {
            len: data.len(),
            max: max_len,
        });
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed frame asynchronously.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, ChatError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ChatError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(ChatError::FrameTooLarge { len, max: max_len });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Read half of a framed envelope stream.
pub struct EnvelopeReader<R> {
    reader: BufReader<R>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin + Send> EnvelopeReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_frame_len,
        }
    }

    /// Reads and decodes the next envelope.
    pub async fn receive(&mut self) -> Result<Envelope, ChatError> {
        let data = read_length_prefixed(&mut self.reader, self.max_frame_len).await?;
        Envelope::decode(&data)
    }
}

/// Write half of a framed envelope stream.
pub struct EnvelopeWriter<W> {
    writer: BufWriter<W>,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin + Send> EnvelopeWriter<W> {
    pub fn new(inner: W, max_frame_len: usize) -> Self {
        Self {
            writer: BufWriter::new(inner),
            max_frame_len,
        }
    }

    /// Encodes and writes one envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        let data = envelope.encode()?;
        write_length_prefixed(&mut self.writer, &data, self.max_frame_len).await
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
