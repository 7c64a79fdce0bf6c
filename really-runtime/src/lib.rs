//! Runtime components for really worker processes
//!
//! A worker dials the pool's socket, takes one job per connection and runs
//! the user's handler for it, keeping at most `concurrency_level` jobs in
//! flight.

pub mod error;
pub mod worker;

// Re-export commonly used types
pub use error::RuntimeError;
pub use worker::{worker_main, Worker, WorkerIdentity, WorkerStats};
