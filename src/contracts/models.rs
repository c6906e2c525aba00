use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub use super::aliases::{ContractFields, ProductFields};

/// Upper bound on line items per contract.
pub const MAX_PRODUCTS: usize = 10;

/// A stored contract with its JSON bags decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: i64,
    #[serde(flatten)]
    pub fields: ContractFields,
    pub sales_employee_id: Option<i64>,
    pub terms: Vec<String>,
    pub process_status: BTreeMap<String, String>,
    pub extra_info: Map<String, Value>,
    pub raw_data: Map<String, Value>,
    pub products: Vec<ContractProduct>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractProduct {
    pub id: i64,
    pub contract_id: i64,
    pub product_index: i64,
    #[serde(flatten)]
    pub fields: ProductFields,
    pub extra_info: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: i64,
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductType {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub status: String,
    pub created_at: String,
}

/// A process attached to a product type at a sequence position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductTypeStep {
    pub process: Process,
    pub sequence_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductTypeDetail {
    #[serde(flatten)]
    pub product_type: ProductType,
    pub processes: Vec<ProductTypeStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid process record status: {}", s)),
        }
    }
}

/// A production record. Only its link to a contract product matters here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: i64,
    pub contract_product_id: i64,
    pub process_id: Option<i64>,
    pub employee_id: Option<i64>,
    pub status: RecordStatus,
    pub actual_time: Option<i64>,
    pub created_at: String,
}

// ── Reference-data request payloads ───────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmployee {
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProcess {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProductType {
    pub name: String,
    /// Generated as `PTnnn` when absent or blank.
    pub code: Option<String>,
    pub status: Option<String>,
    /// Attached in this order; position becomes `sequenceOrder`.
    #[serde(default)]
    pub process_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProcessRecord {
    pub contract_product_id: i64,
    pub process_id: Option<i64>,
    pub employee_id: Option<i64>,
    pub status: Option<RecordStatus>,
    pub actual_time: Option<i64>,
}

/// What a contract delete removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSummary {
    pub id: i64,
    pub product_count: usize,
    pub process_record_count: usize,
}

// ── List / import shapes ──────────────────────────────────────────────

/// Filters accepted by the contract list endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractQuery {
    #[serde(default, deserialize_with = "lenient_number")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub page_size: Option<i64>,
    pub keyword: Option<String>,
    pub status: Option<String>,
    pub sales_id: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl ContractQuery {
    pub const DEFAULT_PAGE_SIZE: i64 = 20;
    pub const MAX_PAGE_SIZE: i64 = 100;

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> i64 {
        match self.page_size {
            Some(size) if size > 0 => size.min(Self::MAX_PAGE_SIZE),
            _ => Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn offset(&self) -> i64 {
        self.page().saturating_sub(1).saturating_mul(self.limit())
    }
}

/// Paging numbers that do not parse are treated as absent.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| v.trim().parse().ok()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractPage {
    pub pagination: Pagination,
    pub items: Vec<Contract>,
}

/// One rejected record of a bulk import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportFailure {
    pub index: usize,
    pub contract_number: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub contracts: Vec<Contract>,
    pub errors: Vec<ImportFailure>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
