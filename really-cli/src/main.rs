use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use really_config::{ConfigLoader, LogLevel, ReallyConfig};

mod cli;
mod commands;

use cli::{Cli, Commands, ConfigCommands};
use commands::DispatchOptions;

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<ReallyConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Initialize logging from configuration, with the CLI level taking precedence
fn init_logging(config: &ReallyConfig, log_level: Option<&String>) -> Result<()> {
    let mut logging_config = config.logging.clone();
    if let Some(level_str) = log_level {
        match level_str.parse::<LogLevel>() {
            Ok(level) => logging_config.level = level,
            Err(e) => eprintln!("{}, keeping '{}'", e, logging_config.level),
        }
    }

    really_logging::init_logging_from_config(&logging_config)?;
    debug!("Logging initialized");
    Ok(())
}

// One cooperative scheduler per process; parallelism comes from the workers
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker mode logs to stderr and ignores the pool's configuration file
    if let Some(Commands::Worker) = &cli.command {
        return commands::run_worker().await;
    }

    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.log_level.as_ref())?;

    match cli.command {
        Some(Commands::Dispatch {
            jobs,
            message,
            workers,
            concurrency,
            action,
            duration_ms,
        }) => {
            let options = DispatchOptions {
                jobs,
                message,
                workers,
                concurrency,
                action,
                duration_ms,
            };
            commands::handle_dispatch(config.pool, options).await
        }
        Some(Commands::Worker) => commands::run_worker().await,
        Some(Commands::Config { config_cmd }) => match config_cmd {
            ConfigCommands::Sample => commands::handle_config_sample(),
            ConfigCommands::Validate { config_file } => {
                commands::handle_config_validate(&config_file)
            }
            ConfigCommands::Show { format } => commands::handle_config_show(&config, &format),
        },
        None => {
            // If no subcommand is provided, print help
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
