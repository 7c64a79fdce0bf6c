//! `really config`: sample, validate and show configuration

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info};

use really_config::{ConfigLoader, ReallyConfig};

/// Print a sample configuration with every default filled in
pub fn handle_config_sample() -> Result<()> {
    println!("{}", ReallyConfig::generate_sample());
    Ok(())
}

/// Handle configuration validation
pub fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e).context(format!("Invalid configuration in {:?}", config_file))
        }
    }
}

/// Handle configuration display
pub fn handle_config_show(config: &ReallyConfig, format: &str) -> Result<()> {
    let output = match format.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::to_string(config).context("Failed to serialize to YAML")?,
        "json" => serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?,
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    };
    println!("{}", output);
    Ok(())
}
