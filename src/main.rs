use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::warn;

use contract_desk::config::{AppConfig, CliOverrides, DEFAULT_CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "contract-desk")]
#[command(version, about = "Contract intake service for the factory back office")]
pub struct Cli {
    /// Path to contract-desk.toml (defaults to ./contract-desk.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides the config file and CONTRACT_DESK_DB.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the REST API
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and a default contract-desk.toml
    Init,
    /// Import contracts from a JSON file
    Import {
        /// File holding `{"contracts": [...]}` or a bare array
        file: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut overrides = CliOverrides {
        db_path: cli.db_path.clone(),
        log_json: cli.log_json,
        ..Default::default()
    };
    if let Commands::Serve { host, port, dev } = &cli.command {
        overrides.host = host.clone();
        overrides.port = *port;
        overrides.dev = *dev;
    }

    // `init` may name a config file it is about to create.
    let file_arg = match (&cli.command, cli.config.as_deref()) {
        (Commands::Init, Some(path)) if !path.exists() => None,
        (_, path) => path,
    };
    let config = AppConfig::load(file_arg, &overrides)?;
    contract_desk::telemetry::init_tracing(&config)?;
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE).to_path_buf());

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Init => cmd::cmd_init(&config, &config_path)?,
        Commands::Import { file } => cmd::cmd_import(&config, file)?,
        Commands::Config { command } => cmd::cmd_config(
            &config,
            &config_path,
            command.clone().unwrap_or(ConfigCommands::Show),
        )?,
    }

    Ok(())
}
