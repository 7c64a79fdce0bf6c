use anyhow::Result;
use really_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Level used by worker processes when `RUST_LOG` is unset
const WORKER_DEFAULT_LEVEL: &str = "warn";

/// Build the filter, letting `RUST_LOG` win over the configured level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config.level.as_str());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // Use try_init to avoid panic if global subscriber already set
    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize logging for a worker process.
///
/// Output goes to stderr without ANSI colours, since it usually ends up in a
/// pipe owned by the pool.
pub fn init_worker_logging() -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter(WORKER_DEFAULT_LEVEL))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}
