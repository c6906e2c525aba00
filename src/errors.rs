//! Typed error hierarchy for contract intake.
//!
//! `ContractError` covers every failure the persistence pipeline can
//! surface. Storage plumbing below it uses `anyhow` with context and is
//! folded into `Database` / `Other` at the boundary.

use thiserror::Error;

/// Errors from normalization-backed persistence and reference data.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{0}")]
    Validation(String),

    #[error("Contract number '{contract_number}' already exists")]
    DuplicateContractNumber { contract_number: String },

    #[error("{entity} code '{code}' already exists")]
    DuplicateCode { entity: &'static str, code: String },

    #[error("Contract {id} not found")]
    ContractNotFound { id: i64 },

    #[error(
        "Contract products {product_ids:?} are referenced by {reference_count} production records and cannot be removed or replaced"
    )]
    ProductInUse {
        product_ids: Vec<i64>,
        reference_count: i64,
    },

    #[error(
        "Contract products are referenced by {process_record_count} production records; resolve them first or delete with force=true"
    )]
    ContractInUse {
        product_ids: Vec<i64>,
        process_record_count: i64,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ContractError {
    fn from(err: rusqlite::Error) -> Self {
        ContractError::Database(anyhow::Error::new(err))
    }
}

impl ContractError {
    /// True for failures caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            ContractError::Database(_) | ContractError::LockPoisoned | ContractError::Other(_)
        )
    }
}
