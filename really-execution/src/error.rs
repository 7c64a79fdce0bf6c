//! Error types for the pool and its worker processes

use really_config::ConfigError;
use really_ipc::{HandlerError, IpcError};
use really_resilience::ShutdownError;
use thiserror::Error;

/// Errors raised while building the pool or managing worker processes
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error("IPC error: {0}")]
    IpcError(#[from] IpcError),

    #[error("Failed to spawn worker {id}: {source}")]
    SpawnError {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Shutdown error: {0}")]
    ShutdownError(#[from] ShutdownError),

    /// An operation was attempted on a handle in the wrong state
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Ways a dispatched job can fail. Every dispatch resolves to exactly one
/// result; none of these is raised synchronously.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The pool was stopping when the job was submitted
    #[error("Pool is closing")]
    PoolClosing,

    /// The listener stopped before a worker connection became available
    #[error("Pool server stopped accepting connections")]
    ServerStopped,

    /// The worker went away before writing a response
    #[error("Worker closed the connection without a response")]
    EmptyResponse,

    /// The handler reported an error or panicked
    #[error(transparent)]
    Handler(HandlerError),

    #[error("Transport error: {0}")]
    Ipc(IpcError),

    /// The job task ended without producing a result
    #[error("Job aborted: {0}")]
    Aborted(String),
}

impl DispatchError {
    /// Check if the failure came from the channel rather than the handler
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            DispatchError::ServerStopped | DispatchError::EmptyResponse | DispatchError::Ipc(_)
        )
    }

    /// The handler's error, if that is what failed
    pub fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            DispatchError::Handler(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IpcError> for DispatchError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::EmptyResponse => DispatchError::EmptyResponse,
            other => DispatchError::Ipc(other),
        }
    }
}

impl From<HandlerError> for DispatchError {
    fn from(err: HandlerError) -> Self {
        DispatchError::Handler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_mapping() {
        assert!(matches!(
            DispatchError::from(IpcError::EmptyResponse),
            DispatchError::EmptyResponse
        ));
        assert!(matches!(
            DispatchError::from(IpcError::ConnectionClosed),
            DispatchError::Ipc(IpcError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_classification() {
        assert!(DispatchError::EmptyResponse.is_transport_error());
        assert!(DispatchError::ServerStopped.is_transport_error());
        assert!(!DispatchError::PoolClosing.is_transport_error());

        let err = DispatchError::from(HandlerError::failed("nope"));
        assert!(!err.is_transport_error());
        assert_eq!(err.handler_error().map(|e| e.message()), Some("nope"));
        assert_eq!(err.to_string(), "Handler failed: nope");
    }
}
