//! CLI argument parsing definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a pool of `really worker` processes and dispatch jobs to it
    Dispatch {
        /// Number of jobs to dispatch
        #[arg(long, value_name = "N", default_value_t = 10)]
        jobs: usize,

        /// Message sent with every job
        #[arg(long, value_name = "STRING", default_value = "olleh")]
        message: String,

        /// Number of worker processes (overrides the configuration)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Concurrent jobs per worker (overrides the configuration)
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// What each worker does with a job
        #[arg(long, value_enum, default_value_t = Action::Reverse)]
        action: Action,

        /// Sleep duration for the sleep action
        #[arg(long, value_name = "MS", default_value_t = 100)]
        duration_ms: u64,
    },

    /// Run as a pool worker (started by the pool, reads REALLY_* variables)
    #[command(hide = true)]
    Worker,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print a sample configuration file
    Sample,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Show the configuration in use
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}

/// Demo workloads understood by `really worker`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Reply with the message reversed
    Reverse,
    /// Sleep for `duration_ms`, then reverse
    Sleep,
    /// Return a handler error
    Fail,
    /// Panic inside the handler
    Panic,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Reverse => "reverse",
            Action::Sleep => "sleep",
            Action::Fail => "fail",
            Action::Panic => "panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dispatch() {
        let cli = Cli::try_parse_from([
            "really",
            "dispatch",
            "--jobs",
            "5",
            "--workers",
            "2",
            "--action",
            "sleep",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Dispatch {
                jobs,
                message,
                workers,
                concurrency,
                action,
                ..
            }) => {
                assert_eq!(jobs, 5);
                assert_eq!(message, "olleh");
                assert_eq!(workers, Some(2));
                assert_eq!(concurrency, None);
                assert_eq!(action, Action::Sleep);
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn test_parse_worker_and_global_config() {
        let cli = Cli::try_parse_from(["really", "worker", "--config", "pool.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Worker)));
        assert_eq!(cli.config, Some(PathBuf::from("pool.yaml")));
    }

    #[test]
    fn test_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["really", "dispatch", "--action", "explode"]).is_err());
    }
}
