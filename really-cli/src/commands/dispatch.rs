//! `really dispatch`: run a pool of `really worker` processes and send it jobs

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{info, warn};

use really_config::{OutputMode, PoolConfig};
use really_execution::Pool;
use really_ipc::GenericPayload;
use really_resilience::shutdown_signal;

use crate::cli::Action;

/// Subcommand that makes this binary act as a worker
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Exit status after a second interrupt, as a shell reports SIGINT
const FORCED_EXIT_CODE: i32 = 130;

/// How long a forced exit waits for the worker handles
const FORCED_KILL_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// What to dispatch
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub jobs: usize,
    pub message: String,
    pub workers: Option<usize>,
    pub concurrency: Option<usize>,
    pub action: Action,
    pub duration_ms: u64,
}

/// Build the pool configuration for a dispatch run.
///
/// Without a configured script the workers are this executable started as
/// `really worker`. Nothing reads captured worker output here, so `capture`
/// becomes `forward`.
pub fn pool_config(mut config: PoolConfig, options: &DispatchOptions) -> Result<PoolConfig> {
    if config.script.as_os_str().is_empty() {
        config.script = std::env::current_exe().context("Failed to locate the really executable")?;
        config.worker_args.insert(0, WORKER_SUBCOMMAND.to_string());
    }
    if let Some(workers) = options.workers {
        config.workers_count = workers;
    }
    if let Some(concurrency) = options.concurrency {
        config.concurrency_level = concurrency;
    }
    if config.output == OutputMode::Capture {
        config.output = OutputMode::Forward;
    }
    Ok(config)
}

/// The payload sent for every job
pub fn job_payload(options: &DispatchOptions) -> GenericPayload {
    GenericPayload::default()
        .with("action", options.action.as_str())
        .with("message", options.message.as_str())
        .with("duration_ms", options.duration_ms)
}

/// Dispatch `options.jobs` jobs and print one line per result
pub async fn handle_dispatch(config: PoolConfig, options: DispatchOptions) -> Result<()> {
    let pool = Pool::new(pool_config(config, &options)?)
        .await
        .context("Failed to start the worker pool")?;
    let signals = tokio::spawn(watch_signals(pool.clone()));

    let handles: Vec<_> = (0..options.jobs)
        .map(|_| pool.dispatch(job_payload(&options)))
        .collect();
    let results = join_all(handles).await;

    let mut succeeded = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => {
                succeeded += 1;
                println!("job {}: {}", index, value);
            }
            Err(e) => println!("job {}: error: {}", index, e),
        }
    }

    pool.stop().await;
    signals.abort();
    info!("{}/{} jobs succeeded", succeeded, options.jobs);
    Ok(())
}

/// First signal: drain and stop. Second signal: kill the workers and exit.
async fn watch_signals(pool: Pool) {
    let signal = shutdown_signal().await;
    warn!(
        "Received {}, waiting for outstanding jobs; send it again to exit now",
        signal
    );
    if !pool.config().handle_signals {
        let stopping = pool.clone();
        tokio::spawn(async move { stopping.stop().await });
    }

    let signal = shutdown_signal().await;
    warn!("Received {} again, killing workers", signal);
    match tokio::time::timeout(FORCED_KILL_LOCK_TIMEOUT, pool.worker_processes()).await {
        Ok(mut workers) => {
            join_all(workers.iter_mut().map(|w| w.kill(Duration::ZERO))).await;
        }
        Err(_) => warn!("Worker handles busy, exiting without killing them"),
    }
    std::process::exit(FORCED_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DispatchOptions {
        DispatchOptions {
            jobs: 3,
            message: "olleh".to_string(),
            workers: None,
            concurrency: Some(7),
            action: Action::Sleep,
            duration_ms: 25,
        }
    }

    #[test]
    fn test_pool_config_defaults_to_this_executable() {
        let config = pool_config(PoolConfig::default(), &options()).unwrap();
        assert_eq!(config.script, std::env::current_exe().unwrap());
        assert_eq!(config.worker_args, vec![WORKER_SUBCOMMAND.to_string()]);
        assert_eq!(config.workers_count, PoolConfig::default().workers_count);
        assert_eq!(config.concurrency_level, 7);
        assert_eq!(config.output, OutputMode::Forward);
    }

    #[test]
    fn test_pool_config_keeps_explicit_output_mode() {
        let configured = PoolConfig {
            output: OutputMode::Inherit,
            ..PoolConfig::default()
        };
        let config = pool_config(configured, &options()).unwrap();
        assert_eq!(config.output, OutputMode::Inherit);
    }

    #[test]
    fn test_pool_config_keeps_configured_script() {
        let configured = PoolConfig {
            worker_args: vec!["--fast".to_string()],
            ..PoolConfig::new("/usr/local/bin/my-worker")
        };
        let config = pool_config(
            configured,
            &DispatchOptions {
                workers: Some(2),
                ..options()
            },
        )
        .unwrap();
        assert_eq!(config.script, std::path::PathBuf::from("/usr/local/bin/my-worker"));
        assert_eq!(config.worker_args, vec!["--fast".to_string()]);
        assert_eq!(config.workers_count, 2);
    }

    #[test]
    fn test_job_payload() {
        let payload = job_payload(&options());
        assert_eq!(payload.get_str("action"), Some("sleep"));
        assert_eq!(payload.get_str("message"), Some("olleh"));
        assert_eq!(payload.get_u64("duration_ms"), Some(25));
    }
}
