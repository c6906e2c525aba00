//! Layered configuration for contract-desk.
//!
//! Settings are merged from (lowest to highest priority):
//! 1. `contract-desk.toml`
//! 2. Environment variables (a `.env` file is loaded by the binary first)
//! 3. CLI flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".contract-desk/contracts.db"
//! dev_mode = false
//!
//! [logging]
//! json = false
//! filter = "info"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_CONFIG_FILE: &str = "contract-desk.toml";

pub const ENV_HOST: &str = "CONTRACT_DESK_HOST";
pub const ENV_PORT: &str = "CONTRACT_DESK_PORT";
pub const ENV_DB: &str = "CONTRACT_DESK_DB";
pub const ENV_DEV: &str = "CONTRACT_DESK_DEV";
pub const ENV_LOG_JSON: &str = "CONTRACT_DESK_LOG_JSON";
pub const ENV_LOG_FILTER: &str = "RUST_LOG";

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".contract-desk/contracts.db"),
            dev_mode: false,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub json: bool,
    /// `EnvFilter` directive, e.g. `info,contract_desk=debug`.
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

/// The complete contract-desk.toml structure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeskToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl DeskToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse contract-desk.toml")
    }

    /// Load from `path` when it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize contract-desk.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub log_json: bool,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub log_json: bool,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_toml(DeskToml::default())
    }
}

impl AppConfig {
    /// Resolve file → process environment → CLI.
    ///
    /// An explicitly named config file must exist; the default one is optional.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let toml = match config_path {
            Some(path) => DeskToml::load(path)?,
            None => DeskToml::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?,
        };
        let mut config = Self::from_toml(toml);
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn from_toml(toml: DeskToml) -> Self {
        Self {
            host: toml.server.host,
            port: toml.server.port,
            db_path: toml.server.db_path,
            dev_mode: toml.server.dev_mode,
            log_json: toml.logging.json,
            log_filter: toml.logging.filter,
        }
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got '{}'", ENV_PORT, port))?;
        }
        if let Some(db) = lookup(ENV_DB).filter(|v| !v.trim().is_empty()) {
            self.db_path = PathBuf::from(db.trim());
        }
        if let Some(dev) = lookup(ENV_DEV) {
            self.dev_mode = parse_flag(ENV_DEV, &dev)?;
        }
        if let Some(json) = lookup(ENV_LOG_JSON) {
            self.log_json = parse_flag(ENV_LOG_JSON, &json)?;
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER).filter(|v| !v.trim().is_empty()) {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(db_path) = &cli.db_path {
            self.db_path = db_path.clone();
        }
        if cli.dev {
            self.dev_mode = true;
        }
        if cli.log_json {
            self.log_json = true;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.port == 0 {
            warnings.push("Port 0 binds a random free port".to_string());
        }
        if let Err(e) = EnvFilter::try_new(&self.log_filter) {
            warnings.push(format!(
                "Invalid log filter '{}': {}; falling back to 'info'",
                self.log_filter, e
            ));
        }
        if self.dev_mode && !is_loopback(&self.host) {
            warnings.push(format!(
                "Dev mode enables permissive CORS on non-loopback host '{}'",
                self.host
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            warnings.push("Database path is empty".to_string());
        }

        warnings
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", name, other),
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1")
}
