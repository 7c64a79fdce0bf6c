//! Domain-driven configuration management for really
//!
//! This crate provides the pool and logging configuration domains with
//! validation, defaults, YAML loading and environment variable overrides,
//! plus the environment contract every worker process is started with.

pub mod domains;
pub mod environment;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::{OutputMode, PoolConfig, TransportKind, DEFAULT_MAX_FRAME_BYTES},
    ReallyConfig,
};
pub use environment::{
    WorkerEnvironment, CONCURRENCY_LEVEL_VAR, IDENTIFIER_VAR, MAX_FRAME_BYTES_VAR, SERVER_VAR,
};
