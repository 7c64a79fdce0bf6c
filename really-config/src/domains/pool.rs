//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::{validate_at_most, validate_positive, validate_required_string, Validatable};

/// Frame limit used when none is configured
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Executable started once per worker slot
    pub script: PathBuf,

    /// Extra arguments passed to every worker executable
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Number of worker processes
    #[serde(default = "default_workers_count")]
    pub workers_count: usize,

    /// Maximum number of jobs each worker runs at once
    #[serde(default = "default_concurrency_level")]
    pub concurrency_level: usize,

    /// Socket family of the pool's listener
    #[serde(default)]
    pub transport: TransportKind,

    /// Interface the TCP listener binds to
    #[serde(default = "default_tcp_host")]
    pub tcp_host: String,

    /// Largest frame accepted in either direction. Workers receive it through
    /// `REALLY_MAX_FRAME_BYTES`; larger requests are rejected before sending.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Time a worker gets to exit after SIGTERM before it is killed
    #[serde(with = "humantime_serde", default = "default_kill_grace_period")]
    pub kill_grace_period: Duration,

    /// Upper bound on waiting for outstanding jobs during stop; unset waits forever
    #[serde(with = "humantime_serde::option", default)]
    pub drain_timeout: Option<Duration>,

    /// Whether SIGINT/SIGTERM stop the pool.
    ///
    /// Once installed, the runtime's handlers replace the default signal
    /// action for the rest of the process, also after `stop()`.
    #[serde(default = "default_handle_signals")]
    pub handle_signals: bool,

    /// What happens to the stdout/stderr of worker processes
    #[serde(default)]
    pub output: OutputMode,
}

/// Socket family used between the pool and its workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Unix,
    Tcp,
}

/// Handling of worker stdout/stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Piped and kept as readable handles on each worker process.
    ///
    /// The owner must read them: a worker that fills the pipe buffer
    /// (about 64 KiB on Linux) blocks on its next write, and so does any job
    /// it is serving.
    #[default]
    Capture,
    /// Piped and re-emitted line by line through the pool's log output
    Forward,
    /// Shared with the pool process
    Inherit,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::new(),
            worker_args: Vec::new(),
            workers_count: default_workers_count(),
            concurrency_level: default_concurrency_level(),
            transport: TransportKind::default(),
            tcp_host: default_tcp_host(),
            max_frame_bytes: default_max_frame_bytes(),
            kill_grace_period: default_kill_grace_period(),
            drain_timeout: None,
            handle_signals: default_handle_signals(),
            output: OutputMode::default(),
        }
    }
}

impl PoolConfig {
    /// Configuration for `script` with every other field at its default
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    /// Check that the worker executable exists and can be opened for reading
    pub fn check_script(&self) -> ConfigResult<()> {
        if self.script.as_os_str().is_empty() {
            return Err(self.validation_error("script cannot be empty"));
        }
        let metadata = std::fs::metadata(&self.script).map_err(|e| {
            self.validation_error(format!(
                "script \"{}\" is not readable: {}",
                self.script.display(),
                e
            ))
        })?;
        if !metadata.is_file() {
            return Err(self.validation_error(format!(
                "script \"{}\" is not a file",
                self.script.display()
            )));
        }
        std::fs::File::open(&self.script).map_err(|e| {
            self.validation_error(format!(
                "script \"{}\" is not readable: {}",
                self.script.display(),
                e
            ))
        })?;
        Ok(())
    }
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(unix) {
            TransportKind::Unix
        } else {
            TransportKind::Tcp
        }
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unix" => Ok(TransportKind::Unix),
            "tcp" => Ok(TransportKind::Tcp),
            _ => Err(ConfigError::ValidationError(format!(
                "Invalid transport: {} (expected unix or tcp)",
                s
            ))),
        }
    }
}

impl FromStr for OutputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "capture" => Ok(OutputMode::Capture),
            "forward" => Ok(OutputMode::Forward),
            "inherit" => Ok(OutputMode::Inherit),
            _ => Err(ConfigError::ValidationError(format!(
                "Invalid output mode: {} (expected capture, forward or inherit)",
                s
            ))),
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.workers_count, "workers_count", self.domain_name())?;
        validate_positive(self.concurrency_level, "concurrency_level", self.domain_name())?;
        validate_positive(self.max_frame_bytes, "max_frame_bytes", self.domain_name())?;
        validate_at_most(
            self.max_frame_bytes as u64,
            u32::MAX as u64,
            "max_frame_bytes",
            self.domain_name(),
        )?;

        if self.transport == TransportKind::Tcp {
            validate_required_string(&self.tcp_host, "tcp_host", self.domain_name())?;
        }

        if cfg!(not(unix)) && self.transport == TransportKind::Unix {
            return Err(self.validation_error("unix transport is not available on this platform"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

// Default value functions
fn default_workers_count() -> usize {
    8
}

fn default_concurrency_level() -> usize {
    100
}

fn default_tcp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_kill_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_handle_signals() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.workers_count, 8);
        assert_eq!(config.concurrency_level, 100);
        assert_eq!(config.kill_grace_period, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, None);
        assert!(config.handle_signals);
        assert_eq!(config.output, OutputMode::Capture);
        assert_eq!(OutputMode::default(), OutputMode::Capture);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_validation() {
        let mut config = PoolConfig::new("/bin/true");
        config.workers_count = 0;
        assert!(config.validate().is_err());

        config.workers_count = 1;
        config.concurrency_level = 0;
        assert!(config.validate().is_err());

        config.concurrency_level = 1;
        config.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        config.max_frame_bytes = 1024;
        config.transport = TransportKind::Tcp;
        config.tcp_host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_script() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(PoolConfig::new(file.path()).check_script().is_ok());

        let dir = tempfile::tempdir().unwrap();
        assert!(PoolConfig::new(dir.path()).check_script().is_err());
        assert!(PoolConfig::new(dir.path().join("missing")).check_script().is_err());
        assert!(PoolConfig::default().check_script().is_err());
    }

    #[test]
    fn test_transport_and_output_from_str() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("unix".parse::<TransportKind>().unwrap(), TransportKind::Unix);
        assert!("udp".parse::<TransportKind>().is_err());

        assert_eq!("forward".parse::<OutputMode>().unwrap(), OutputMode::Forward);
        assert!("discard".parse::<OutputMode>().is_err());
    }

    #[test]
    fn test_durations_are_human_readable() {
        let yaml = "script: /usr/local/bin/worker\nkill_grace_period: 2s\ndrain_timeout: 1m\n";
        let config: PoolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kill_grace_period, Duration::from_secs(2));
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.workers_count, 8);
    }
}
