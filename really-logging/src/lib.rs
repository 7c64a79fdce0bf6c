//! Logging setup for really
//!
//! Pool processes log to stdout in the configured format. Worker processes
//! always log to stderr so their output never mixes with anything a caller
//! reads from stdout. Library crates emit through `log` or `tracing`; both
//! are collected by the subscriber installed here.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing, init_worker_logging};
pub use really_config::{LogFormat, LogLevel, LoggingConfig};
