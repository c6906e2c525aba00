//! Batch import from a JSON file: `contract-desk import`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use tracing::info;

use contract_desk::config::AppConfig;
use contract_desk::contracts::server::open_database;

/// Import `{"contracts": [...]}` or a bare array. Fails when any record fails.
pub fn cmd_import(config: &AppConfig, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read import file: {}", file.display()))?;
    let body: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Import file is not valid JSON: {}", file.display()))?;

    let db = open_database(&config.db_path)?;
    let report = db.import_contracts(body)?;
    info!(
        file = %file.display(),
        success_count = report.success_count,
        failure_count = report.failure_count,
        "Import finished"
    );

    println!(
        "Imported {} contract(s), {} failed",
        report.success_count, report.failure_count
    );
    for contract in &report.contracts {
        let number = contract.fields.contract_number.as_deref().unwrap_or("-");
        println!("  + {} (id {})", number, contract.id);
    }
    for failure in &report.errors {
        println!(
            "  ! #{} {}: {}",
            failure.index,
            failure.contract_number.as_deref().unwrap_or("-"),
            failure.message
        );
    }

    if !report.is_clean() {
        bail!("{} contract(s) failed to import", report.failure_count);
    }
    Ok(())
}
