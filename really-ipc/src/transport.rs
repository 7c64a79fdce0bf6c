//! IPC transport implementations

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::endpoint::{Connection, Endpoint};
use crate::error::IpcError;
use crate::protocol::{self, ResultEnvelope, DEFAULT_MAX_FRAME_LEN};

/// IPC transport trait for frame-oriented communication
#[async_trait]
pub trait IpcTransport: Send {
    /// Send one frame to the other end
    async fn send_frame(&mut self, body: &[u8]) -> Result<(), IpcError>;

    /// Receive one frame from the other end
    async fn receive_frame(&mut self) -> Result<Vec<u8>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Framed transport over any duplex byte stream
pub struct SocketTransport<S> {
    stream: Option<S>,
    max_frame_len: usize,
}

impl SocketTransport<Connection> {
    /// Dial an endpoint and wrap the resulting connection
    pub async fn connect(endpoint: &Endpoint, max_frame_len: usize) -> Result<Self, IpcError> {
        let connection = Connection::connect(endpoint).await?;
        Ok(Self::with_max_frame_len(connection, max_frame_len))
    }
}

impl<S> SocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a new transport with the default frame limit
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a new transport with a custom frame limit
    pub fn with_max_frame_len(stream: S, max_frame_len: usize) -> Self {
        Self {
            stream: Some(stream),
            max_frame_len,
        }
    }

    fn stream(&mut self) -> Result<&mut S, IpcError> {
        self.stream.as_mut().ok_or(IpcError::ConnectionClosed)
    }

    /// Pool side: announce that this connection now carries a job
    pub async fn send_handshake(&mut self) -> Result<(), IpcError> {
        protocol::write_handshake(self.stream()?).await
    }

    /// Worker side: wait for the pool's handshake token
    pub async fn receive_handshake(&mut self) -> Result<(), IpcError> {
        protocol::read_handshake(self.stream()?).await
    }

    /// Worker side: write the result envelope as the response frame
    pub async fn send_response(&mut self, envelope: &ResultEnvelope) -> Result<(), IpcError> {
        let body = envelope.encode()?;
        self.send_frame(&body).await
    }

    /// Pool side: read the response frame.
    ///
    /// A stream that ends (or is reset) before any response byte arrives is
    /// reported as [`IpcError::EmptyResponse`], as is an empty body.
    pub async fn receive_response(&mut self) -> Result<ResultEnvelope, IpcError> {
        let body = match self.receive_frame().await {
            Ok(body) => body,
            Err(IpcError::ConnectionClosed) => return Err(IpcError::EmptyResponse),
            Err(e) if e.is_disconnect() => return Err(IpcError::EmptyResponse),
            Err(e) => return Err(e),
        };
        ResultEnvelope::decode(&body)
    }

    /// Release the underlying stream without closing it
    pub fn into_inner(mut self) -> Option<S> {
        self.stream.take()
    }
}

#[async_trait]
impl<S> IpcTransport for SocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, body: &[u8]) -> Result<(), IpcError> {
        protocol::write_frame(self.stream()?, body).await
    }

    async fn receive_frame(&mut self) -> Result<Vec<u8>, IpcError> {
        let max_frame_len = self.max_frame_len;
        protocol::read_frame(self.stream()?, max_frame_len).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Take ownership and drop to close
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("Ignoring error while shutting down stream: {}", e);
            }
        }
        Ok(())
    }
}
