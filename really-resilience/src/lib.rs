//! Resilience patterns for really
//!
//! This crate provides outstanding-job tracking for graceful pool shutdown,
//! escalating termination of child processes, and a future that resolves on
//! the first OS termination signal.

pub mod shutdown;
pub mod signal;

// Re-export commonly used types
pub use shutdown::{JobGuard, JobTracker, ProcessShutdownManager, ShutdownError};
pub use signal::{shutdown_signal, TerminationSignal};
