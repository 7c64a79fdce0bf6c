//! Runtime error types

use really_config::ConfigError;
use really_ipc::IpcError;
use thiserror::Error;

/// Errors that stop a worker from starting
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The environment contract is missing or malformed
    #[error("Worker configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The server address could not be used
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}
