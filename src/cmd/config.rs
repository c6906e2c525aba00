//! Configuration view and validation: `contract-desk config`.

use anyhow::Result;
use std::path::Path;

use contract_desk::config::AppConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &AppConfig, config_path: &Path, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!("  host = \"{}\"", config.host);
            println!("  port = {}", config.port);
            println!("  db_path = \"{}\"", config.db_path.display());
            println!("  dev_mode = {}", config.dev_mode);
            println!("  log_json = {}", config.log_json);
            println!("  log_filter = \"{}\"", config.log_filter);
        }
        ConfigCommands::Validate => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
