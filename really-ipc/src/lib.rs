//! Inter-process communication for really
//!
//! This crate provides the wire protocol shared by the pool and its worker
//! processes: the `ping` handshake, length-prefixed frames, the result
//! envelope, the payload abstraction and the socket transport both sides
//! speak over.

pub mod endpoint;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use endpoint::{Connection, Endpoint, Listener};
pub use error::IpcError;
pub use payload::{GenericPayload, Payload};
pub use protocol::{
    HandlerError, ResultEnvelope, DEFAULT_MAX_FRAME_LEN, FRAME_PREFIX_LEN, HANDSHAKE_TOKEN,
};
pub use transport::{IpcTransport, SocketTransport};
