//! CLI command implementations

pub mod config;
pub mod dispatch;
pub mod worker;

pub use config::*;
pub use dispatch::*;
pub use worker::*;
