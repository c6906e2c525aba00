//! Workspace setup: `contract-desk init`.

use anyhow::Result;
use std::path::Path;

use contract_desk::config::{AppConfig, DeskToml};
use contract_desk::contracts::server::open_database;

/// Create the database and write a config file unless one already exists.
pub fn cmd_init(config: &AppConfig, config_path: &Path) -> Result<()> {
    open_database(&config.db_path)?;
    println!("Contract database initialized at {}", config.db_path.display());

    if config_path.exists() {
        println!("Keeping existing config at {}", config_path.display());
        return Ok(());
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut toml = DeskToml::default();
    toml.server.db_path = config.db_path.clone();
    toml.save(config_path)?;
    println!("Created {}", config_path.display());
    Ok(())
}
