//! Environment contract between the pool and the worker processes it spawns

use crate::domains::pool::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{ConfigError, ConfigResult};

/// Address of the pool's listening socket (`tcp://host:port` or `unix://path`)
pub const SERVER_VAR: &str = "REALLY_SERVER";

/// Numeric worker identifier, unique within one pool
pub const IDENTIFIER_VAR: &str = "REALLY_IDENTIFIER";

/// Maximum number of jobs the worker may run at once
pub const CONCURRENCY_LEVEL_VAR: &str = "REALLY_CONCURRENCY_LEVEL";

/// Largest request frame the worker accepts; optional, 64 MiB when unset
pub const MAX_FRAME_BYTES_VAR: &str = "REALLY_MAX_FRAME_BYTES";

/// Values a worker process receives at spawn time.
///
/// They are fixed for the lifetime of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnvironment {
    pub server: String,
    pub identifier: u32,
    pub concurrency_level: usize,
    pub max_frame_bytes: usize,
}

impl WorkerEnvironment {
    pub fn new(server: impl Into<String>, identifier: u32, concurrency_level: usize) -> Self {
        Self {
            server: server.into(),
            identifier,
            concurrency_level,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Read the contract from the current process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the contract through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = required(&lookup, SERVER_VAR)?;
        if server.trim().is_empty() {
            return Err(invalid(SERVER_VAR, &server, "must not be empty"));
        }

        let raw_identifier = required(&lookup, IDENTIFIER_VAR)?;
        let identifier = raw_identifier
            .trim()
            .parse::<u32>()
            .map_err(|e| invalid(IDENTIFIER_VAR, &raw_identifier, &e.to_string()))?;

        let raw_level = required(&lookup, CONCURRENCY_LEVEL_VAR)?;
        let concurrency_level = raw_level
            .trim()
            .parse::<usize>()
            .map_err(|e| invalid(CONCURRENCY_LEVEL_VAR, &raw_level, &e.to_string()))?;
        if concurrency_level == 0 {
            return Err(invalid(CONCURRENCY_LEVEL_VAR, &raw_level, "must be greater than 0"));
        }

        let max_frame_bytes = match lookup(MAX_FRAME_BYTES_VAR) {
            None => DEFAULT_MAX_FRAME_BYTES,
            Some(raw) => {
                let value = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| invalid(MAX_FRAME_BYTES_VAR, &raw, &e.to_string()))?;
                if value == 0 {
                    return Err(invalid(MAX_FRAME_BYTES_VAR, &raw, "must be greater than 0"));
                }
                value
            }
        };

        Ok(Self {
            server,
            identifier,
            concurrency_level,
            max_frame_bytes,
        })
    }

    /// Variables to add to a worker's environment
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (SERVER_VAR, self.server.clone()),
            (IDENTIFIER_VAR, self.identifier.to_string()),
            (CONCURRENCY_LEVEL_VAR, self.concurrency_level.to_string()),
            (MAX_FRAME_BYTES_VAR, self.max_frame_bytes.to_string()),
        ]
    }
}

fn required<F>(lookup: &F, name: &str) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or_else(|| {
        ConfigError::EnvError(format!("\"{}\" environment variable is missing.", name))
    })
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::EnvError(format!(
        "\"{}\" environment variable has invalid value {:?}: {}",
        name, value, reason
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_from_lookup() {
        let env = WorkerEnvironment::from_lookup(lookup_from(&[
            (SERVER_VAR, "tcp://127.0.0.1:4000"),
            (IDENTIFIER_VAR, "3"),
            (CONCURRENCY_LEVEL_VAR, "20"),
        ]))
        .unwrap();
        assert_eq!(env, WorkerEnvironment::new("tcp://127.0.0.1:4000", 3, 20));
        assert_eq!(env.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn test_max_frame_bytes() {
        let base = [
            (SERVER_VAR, "tcp://127.0.0.1:4000"),
            (IDENTIFIER_VAR, "1"),
            (CONCURRENCY_LEVEL_VAR, "2"),
        ];

        let mut pairs = base.to_vec();
        pairs.push((MAX_FRAME_BYTES_VAR, "134217728"));
        let env = WorkerEnvironment::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(env.max_frame_bytes, 128 * 1024 * 1024);

        for bad in ["0", "-5", "lots"] {
            let mut pairs = base.to_vec();
            pairs.push((MAX_FRAME_BYTES_VAR, bad));
            assert!(
                WorkerEnvironment::from_lookup(lookup_from(&pairs)).is_err(),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_missing_variable() {
        let err = WorkerEnvironment::from_lookup(lookup_from(&[
            (IDENTIFIER_VAR, "0"),
            (CONCURRENCY_LEVEL_VAR, "1"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Environment variable error: \"REALLY_SERVER\" environment variable is missing."
        );
    }

    #[test]
    fn test_malformed_values() {
        for (identifier, level) in [("-1", "4"), ("abc", "4"), ("0", "0"), ("0", "many")] {
            let result = WorkerEnvironment::from_lookup(lookup_from(&[
                (SERVER_VAR, "unix:///tmp/pool.sock"),
                (IDENTIFIER_VAR, identifier),
                (CONCURRENCY_LEVEL_VAR, level),
            ]));
            assert!(
                matches!(result, Err(ConfigError::EnvError(_))),
                "{} / {} should be rejected",
                identifier,
                level
            );
        }
    }

    #[test]
    fn test_to_vars_round_trip() {
        let env = WorkerEnvironment::new("unix:///tmp/x.sock", 7, 100).with_max_frame_bytes(4096);
        let vars: HashMap<String, String> = env
            .to_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = WorkerEnvironment::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(parsed, env);
    }
}
