//! really execution engine
//!
//! This crate owns the parent side of a really process pool: it spawns and
//! terminates worker processes and hands payloads to them over the pool's
//! listening socket.

pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod process;

// Re-export main types
pub use dispatcher::{JobHandle, JobId};
pub use error::{DispatchError, ExecutionError};
pub use pool::Pool;
pub use process::{WorkerCommand, WorkerProcess};
