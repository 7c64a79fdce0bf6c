//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Peer closed the stream before the first byte of a frame
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer closed the stream in the middle of a frame
    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    TruncatedFrame { expected: usize, received: usize },

    /// Length prefix larger than the configured maximum
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The first bytes on a fresh connection were not the handshake token
    #[error("Handshake mismatch: received {received:?}")]
    HandshakeMismatch { received: Vec<u8> },

    /// The worker closed the connection without writing a response
    #[error("Empty response: worker closed the connection without a result")]
    EmptyResponse,

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Endpoint string could not be parsed
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

impl IpcError {
    /// Check if this error is a framing or handshake violation.
    ///
    /// Protocol errors are scoped to one connection: the connection is dropped
    /// and neither side of the pool treats them as fatal.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed
                | IpcError::TruncatedFrame { .. }
                | IpcError::FrameTooLarge { .. }
                | IpcError::HandshakeMismatch { .. }
                | IpcError::InvalidMessage(_)
        )
    }

    /// Check if this error indicates the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            IpcError::ConnectionClosed | IpcError::EmptyResponse => true,
            IpcError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.into())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors() {
        assert!(IpcError::ConnectionClosed.is_protocol_error());
        assert!(IpcError::TruncatedFrame { expected: 4, received: 2 }.is_protocol_error());
        assert!(IpcError::FrameTooLarge { len: 10, max: 5 }.is_protocol_error());
        assert!(IpcError::HandshakeMismatch { received: b"pong".to_vec() }.is_protocol_error());
        assert!(!IpcError::EmptyResponse.is_protocol_error());
        assert!(!IpcError::SerializationError("bad".to_string()).is_protocol_error());
    }

    #[test]
    fn test_disconnects() {
        assert!(IpcError::EmptyResponse.is_disconnect());
        assert!(IpcError::ConnectionClosed.is_disconnect());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(IpcError::from(reset).is_disconnect());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!IpcError::from(denied).is_disconnect());
    }

    #[test]
    fn test_json_error_classification() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        assert!(matches!(IpcError::from(err), IpcError::DeserializationError(_)));
    }
}
