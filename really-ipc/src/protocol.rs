//! Wire protocol definitions: handshake, framing and the result envelope
//!
//! Every connection carries exactly one job:
//!
//! 1. the pool writes the 4-byte [`HANDSHAKE_TOKEN`],
//! 2. the pool writes one request frame holding the serialized payload,
//! 3. the worker writes one response frame holding a [`ResultEnvelope`],
//! 4. the connection is closed.
//!
//! A frame is a little-endian `u32` length prefix followed by exactly that
//! many bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;

/// Token the pool writes on every freshly acquired connection
pub const HANDSHAKE_TOKEN: &[u8; 4] = b"ping";

/// Size of the frame length prefix in bytes
pub const FRAME_PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame body (64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write the handshake token
pub async fn write_handshake<W>(writer: &mut W) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(HANDSHAKE_TOKEN).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly four bytes and check them against the handshake token
pub async fn read_handshake<R>(reader: &mut R) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut token = [0u8; 4];
    let received = read_full(reader, &mut token).await?;
    if received == 0 {
        return Err(IpcError::ConnectionClosed);
    }
    if received < token.len() || &token != HANDSHAKE_TOKEN {
        return Err(IpcError::HandshakeMismatch {
            received: token[..received].to_vec(),
        });
    }
    Ok(())
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(body.len()).map_err(|_| IpcError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, blocking until the whole body arrived
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    let received = read_full(reader, &mut prefix).await?;
    if received == 0 {
        return Err(IpcError::ConnectionClosed);
    }
    if received < FRAME_PREFIX_LEN {
        return Err(IpcError::TruncatedFrame {
            expected: FRAME_PREFIX_LEN,
            received,
        });
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(IpcError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    let received = read_full(reader, &mut body).await?;
    if received < len {
        return Err(IpcError::TruncatedFrame {
            expected: len,
            received,
        });
    }

    Ok(body)
}

/// Fill `buf` as far as the stream allows; returns the bytes read before EOF
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Error raised by a payload handler, carried across the process boundary as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum HandlerError {
    /// The handler returned an error
    Failed {
        message: String,
        details: Option<JsonValue>,
    },

    /// The handler panicked
    Panicked { message: String },
}

impl HandlerError {
    /// Create a plain handler failure
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            details: None,
        }
    }

    /// Create a handler failure with structured details
    pub fn with_details(message: impl Into<String>, details: JsonValue) -> Self {
        HandlerError::Failed {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Create an error describing a caught panic
    pub fn panicked(message: impl Into<String>) -> Self {
        HandlerError::Panicked {
            message: message.into(),
        }
    }

    /// The human readable message, regardless of kind
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Failed { message, .. } | HandlerError::Panicked { message } => message,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Failed { message, .. } => write!(f, "Handler failed: {}", message),
            HandlerError::Panicked { message } => write!(f, "Handler panicked: {}", message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::failed(message)
    }
}

/// Response body written by the worker: exactly one of the two fields is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// JSON text of the computed value
    pub result: Option<String>,
    /// JSON text of a [`HandlerError`]
    pub exception: Option<String>,
}

impl ResultEnvelope {
    /// Envelope carrying a successfully computed value
    pub fn success<T: Serialize>(value: &T) -> Result<Self, IpcError> {
        let result = serde_json::to_string(value)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        Ok(Self {
            result: Some(result),
            exception: None,
        })
    }

    /// Envelope carrying a handler error
    pub fn failure(error: &HandlerError) -> Result<Self, IpcError> {
        let exception = serde_json::to_string(error)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        Ok(Self {
            result: None,
            exception: Some(exception),
        })
    }

    /// Serialize the envelope into a frame body
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        serde_json::to_vec(self).map_err(|e| IpcError::SerializationError(e.to_string()))
    }

    /// Parse a frame body; an empty body means the worker never answered
    pub fn decode(body: &[u8]) -> Result<Self, IpcError> {
        if body.is_empty() {
            return Err(IpcError::EmptyResponse);
        }
        let envelope: ResultEnvelope = serde_json::from_slice(body)
            .map_err(|e| IpcError::DeserializationError(e.to_string()))?;
        envelope.check()?;
        Ok(envelope)
    }

    /// Check that exactly one arm is populated
    pub fn check(&self) -> Result<(), IpcError> {
        match (&self.result, &self.exception) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err(IpcError::InvalidMessage(
                "result envelope has neither a result nor an exception".to_string(),
            )),
            (Some(_), Some(_)) => Err(IpcError::InvalidMessage(
                "result envelope has both a result and an exception".to_string(),
            )),
        }
    }

    /// Whether the envelope carries a handler error
    pub fn is_failure(&self) -> bool {
        self.exception.is_some()
    }

    /// Decode the populated arm into the typed outcome
    pub fn into_outcome<T: DeserializeOwned>(self) -> Result<Result<T, HandlerError>, IpcError> {
        self.check()?;
        match (self.result, self.exception) {
            (Some(result), None) => {
                let value = serde_json::from_str(&result)
                    .map_err(|e| IpcError::DeserializationError(e.to_string()))?;
                Ok(Ok(value))
            }
            (_, Some(exception)) => {
                let error = serde_json::from_str(&exception)
                    .map_err(|e| IpcError::DeserializationError(e.to_string()))?;
                Ok(Err(error))
            }
            (None, None) => Err(IpcError::InvalidMessage(
                "result envelope has neither a result nor an exception".to_string(),
            )),
        }
    }
}
