//! HTTP server command: `contract-desk serve`.

use anyhow::Result;
use contract_desk::config::AppConfig;

pub async fn cmd_serve(config: &AppConfig) -> Result<()> {
    contract_desk::contracts::server::start_server(config).await
}
