//! Persistence orchestration for normalized contracts.
//!
//! Every write runs in one SQLite transaction. Returning early with an error
//! drops the transaction, which rolls back everything done so far, so the
//! production-record gates can fire after product rows were already touched.

use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::aliases::pick_text;
use super::db::{ContractDb, is_unique_violation, placeholders};
use super::models::*;
use super::normalize::{LineItemId, NormalizedContract, NormalizedProduct, line_items};
use super::resolve::{ProductTypeCache, resolve_product_types, resolve_sales_reference};
use crate::errors::ContractError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reject contracts that cannot be persisted. Runs before any transaction.
pub fn validate(contract: &NormalizedContract) -> Result<(), ContractError> {
    if contract.contract_number().is_none() {
        return Err(ContractError::Validation("Contract number is required".into()));
    }
    match contract.products.len() {
        0 => Err(ContractError::Validation(
            "At least one product is required".into(),
        )),
        n if n > MAX_PRODUCTS => Err(ContractError::Validation(format!(
            "A contract holds at most {} products, got {}",
            MAX_PRODUCTS, n
        ))),
        _ => Ok(()),
    }
}

impl ContractDb {
    // ── Writes ────────────────────────────────────────────────────────

    pub fn create_contract(&self, payload: Value) -> Result<Contract, ContractError> {
        let contract = NormalizedContract::from_value(payload);
        validate(&contract)?;
        self.insert_contract(contract)
    }

    /// Insert an already validated contract.
    fn insert_contract(&self, mut contract: NormalizedContract) -> Result<Contract, ContractError> {
        let number = contract.contract_number().unwrap_or_default().to_string();
        if self.contract_id_by_number(&number)?.is_some() {
            return Err(ContractError::DuplicateContractNumber {
                contract_number: number,
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        let sales_employee_id = resolve_sales_reference(&tx, &mut contract.fields)?;
        let mut cache = ProductTypeCache::new();
        resolve_product_types(&tx, &mut cache, &mut contract.products)?;

        let columns = contract_columns(&contract, sales_employee_id)?;
        let sql = format!(
            "INSERT INTO contracts ({}) VALUES ({})",
            columns.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", "),
            placeholders(columns.len())
        );
        match tx.execute(&sql, params_from_iter(columns.into_iter().map(|(_, v)| v))) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ContractError::DuplicateContractNumber {
                    contract_number: number,
                });
            }
            Err(e) => return Err(e.into()),
        }
        let id = tx.last_insert_rowid();

        for (position, product) in contract.products.iter().enumerate() {
            insert_product(&tx, id, position as i64 + 1, product)?;
        }
        tx.commit()?;

        info!(
            contract_id = id,
            contract_number = %number,
            products = contract.products.len(),
            "Contract created"
        );
        Ok(self
            .get_contract(id)?
            .context("Contract not found after insert")?)
    }

    /// Replace a contract from a full payload.
    ///
    /// Scalars absent from the payload keep their stored value; bags, the
    /// sales key and the product list are replaced. Products are matched by
    /// numeric id and renumbered in submission order.
    pub fn update_contract(&self, id: i64, payload: Value) -> Result<Contract, ContractError> {
        let mut contract = NormalizedContract::from_value(payload);
        validate(&contract)?;
        if !self.contract_exists(id)? {
            return Err(ContractError::ContractNotFound { id });
        }
        let number = contract.contract_number().unwrap_or_default().to_string();
        if let Some(owner) = self.contract_id_by_number(&number)? {
            if owner != id {
                return Err(ContractError::DuplicateContractNumber {
                    contract_number: number,
                });
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        let sales_employee_id = resolve_sales_reference(&tx, &mut contract.fields)?;
        let mut cache = ProductTypeCache::new();
        resolve_product_types(&tx, &mut cache, &mut contract.products)?;

        let columns = contract_columns(&contract, sales_employee_id)?;
        let sql = format!(
            "UPDATE contracts SET {}, updated_at = datetime('now') WHERE id = ?",
            assignments(&columns)
        );
        let values = columns
            .into_iter()
            .map(|(_, v)| v)
            .chain(std::iter::once(SqlValue::Integer(id)));
        match tx.execute(&sql, params_from_iter(values)) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ContractError::DuplicateContractNumber {
                    contract_number: number,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let existing = contract_product_ids(&tx, id)?;
        let existing_set: HashSet<i64> = existing.iter().copied().collect();
        let mut retained = HashSet::new();
        for (position, product) in contract.products.iter().enumerate() {
            let position = position as i64 + 1;
            match product.id.as_ref().and_then(LineItemId::numeric) {
                Some(product_id) if existing_set.contains(&product_id) && retained.insert(product_id) => {
                    update_product(&tx, product_id, position, product)?
                }
                _ => insert_product(&tx, id, position, product)?,
            }
        }

        let candidates: Vec<i64> = existing
            .into_iter()
            .filter(|product_id| !retained.contains(product_id))
            .collect();
        if !candidates.is_empty() {
            let reference_count = count_process_records(&tx, &candidates)?;
            if reference_count > 0 {
                warn!(
                    contract_id = id,
                    product_ids = ?candidates,
                    reference_count,
                    "Contract update blocked by production records"
                );
                return Err(ContractError::ProductInUse {
                    product_ids: candidates,
                    reference_count,
                });
            }
            tx.execute(
                &format!(
                    "DELETE FROM contract_products WHERE id IN ({})",
                    placeholders(candidates.len())
                ),
                params_from_iter(candidates.iter()),
            )?;
        }
        tx.commit()?;

        info!(
            contract_id = id,
            products = contract.products.len(),
            removed = candidates.len(),
            "Contract updated"
        );
        Ok(self
            .get_contract(id)?
            .context("Contract not found after update")?)
    }

    /// Delete a contract and its products.
    ///
    /// Production records referencing the products block the delete unless
    /// `force` is set, in which case they are deleted first.
    pub fn delete_contract(&self, id: i64, force: bool) -> Result<DeleteSummary, ContractError> {
        if !self.contract_exists(id)? {
            return Err(ContractError::ContractNotFound { id });
        }

        let tx = self.conn.unchecked_transaction()?;
        let product_ids = contract_product_ids(&tx, id)?;
        let record_count = count_process_records(&tx, &product_ids)?;
        let mut removed_records = 0;
        if record_count > 0 {
            if !force {
                warn!(
                    contract_id = id,
                    product_ids = ?product_ids,
                    record_count,
                    "Contract delete blocked by production records"
                );
                return Err(ContractError::ContractInUse {
                    product_ids,
                    process_record_count: record_count,
                });
            }
            removed_records = tx.execute(
                &format!(
                    "DELETE FROM process_records WHERE contract_product_id IN ({})",
                    placeholders(product_ids.len())
                ),
                params_from_iter(product_ids.iter()),
            )?;
            warn!(
                contract_id = id,
                removed_records,
                "Force delete removed production records"
            );
        }
        tx.execute(
            "DELETE FROM contract_products WHERE contract_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM contracts WHERE id = ?1", params![id])?;
        tx.commit()?;

        info!(contract_id = id, products = product_ids.len(), "Contract deleted");
        Ok(DeleteSummary {
            id,
            product_count: product_ids.len(),
            process_record_count: removed_records,
        })
    }

    /// Create each record of `{contracts: [...]}` (or a bare array) in its own
    /// transaction, collecting per-record failures.
    pub fn import_contracts(&self, body: Value) -> Result<ImportReport, ContractError> {
        let records = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("contracts") {
                Some(Value::Array(items)) => items,
                Some(record @ Value::Object(_)) => vec![record],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        if records.is_empty() {
            return Err(ContractError::Validation(
                "Import requires a non-empty contracts list".into(),
            ));
        }

        let mut contracts = Vec::new();
        let mut errors = Vec::new();
        for (index, record) in records.into_iter().enumerate() {
            let normalized = NormalizedContract::from_value(record);
            let contract_number = normalized.contract_number().map(str::to_string);
            match validate(&normalized).and_then(|()| self.insert_contract(normalized)) {
                Ok(contract) => contracts.push(contract),
                Err(e) => {
                    if e.is_client_error() {
                        warn!(index, error = %e, "Import record rejected");
                    } else {
                        error!(index, error = ?e, "Import record failed");
                    }
                    errors.push(ImportFailure {
                        index,
                        contract_number,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            imported = contracts.len(),
            failed = errors.len(),
            "Contract import finished"
        );
        Ok(ImportReport {
            success_count: contracts.len(),
            failure_count: errors.len(),
            contracts,
            errors,
        })
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn get_contract(&self, id: i64) -> anyhow::Result<Option<Contract>> {
        let sql = format!(
            "SELECT id, {}, sales_employee_id, terms_json, process_status_json,
                    extra_info_json, raw_data_json, created_at, updated_at
             FROM contracts WHERE id = ?1",
            ContractFields::select_list()
        );
        let row = self
            .conn
            .query_row(&sql, params![id], ContractRow::from_row)
            .optional()
            .context("Failed to query contract")?;
        match row {
            Some(row) => {
                let raw_data: Map<String, Value> =
                    decode_bag(row.raw_data_json.as_deref(), "raw_data_json", row.id);
                let products = self.contract_products(row.id, &raw_data)?;
                Ok(Some(row.into_contract(raw_data, products)))
            }
            None => Ok(None),
        }
    }

    /// Filtered, paginated listing, newest first.
    pub fn list_contracts(&self, query: &ContractQuery) -> anyhow::Result<ContractPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = non_blank(query.status.as_deref()) {
            clauses.push("status = ?");
            values.push(SqlValue::Text(status.to_string()));
        }
        if let Some(keyword) = non_blank(query.keyword.as_deref()) {
            clauses.push("(contract_number LIKE ? OR party_a_name LIKE ? OR party_b_name LIKE ?)");
            let pattern = format!("%{}%", keyword);
            for _ in 0..3 {
                values.push(SqlValue::Text(pattern.clone()));
            }
        }
        if let Some(sales_id) = non_blank(query.sales_id.as_deref()) {
            clauses.push("sales_id LIKE ?");
            values.push(SqlValue::Text(format!("%{}%", sales_id)));
        }
        if let Some(from) = query.date_from.as_deref().and_then(lower_bound) {
            clauses.push("created_at >= ?");
            values.push(SqlValue::Text(from));
        }
        match query.date_to.as_deref().and_then(upper_bound) {
            Some(UpperBound::Inclusive(to)) => {
                clauses.push("created_at <= ?");
                values.push(SqlValue::Text(to));
            }
            Some(UpperBound::Before(to)) => {
                clauses.push("created_at < ?");
                values.push(SqlValue::Text(to));
            }
            None => {}
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM contracts{}", where_sql),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .context("Failed to count contracts")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id FROM contracts{} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                where_sql
            ))
            .context("Failed to prepare list_contracts")?;
        let paging = [SqlValue::Integer(query.limit()), SqlValue::Integer(query.offset())];
        let rows = stmt
            .query_map(params_from_iter(values.iter().chain(paging.iter())), |row| {
                row.get::<_, i64>(0)
            })
            .context("Failed to query contracts")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read contract id")?);
        }

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(contract) = self.get_contract(id)? {
                items.push(contract);
            }
        }

        Ok(ContractPage {
            pagination: Pagination {
                page: query.page(),
                page_size: query.limit(),
                total,
            },
            items,
        })
    }

    fn contract_products(
        &self,
        contract_id: i64,
        raw_data: &Map<String, Value>,
    ) -> anyhow::Result<Vec<ContractProduct>> {
        let sql = format!(
            "SELECT id, contract_id, product_index, {}, extra_info_json, created_at, updated_at
             FROM contract_products WHERE contract_id = ?1 ORDER BY product_index, id",
            ProductFields::select_list()
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare contract_products")?;
        let rows = stmt
            .query_map(params![contract_id], |row| {
                let product = ContractProduct {
                    id: row.get("id")?,
                    contract_id: row.get("contract_id")?,
                    product_index: row.get("product_index")?,
                    fields: ProductFields::from_row(row)?,
                    extra_info: Map::new(),
                    created_at: row.get("created_at")?,
                    updated_at: row.get("updated_at")?,
                };
                Ok((product, row.get::<_, Option<String>>("extra_info_json")?))
            })
            .context("Failed to query contract products")?;

        let raw_items = line_items(raw_data);
        let mut products = Vec::new();
        for row in rows {
            let (mut product, extra_info_json) = row.context("Failed to read contract product row")?;
            product.extra_info =
                decode_bag(extra_info_json.as_deref(), "extra_info_json", product.id);
            let raw_item = usize::try_from(product.product_index - 1)
                .ok()
                .and_then(|i| raw_items.get(i).copied());
            backfill_product_type(&mut product.fields, raw_item);
            products.push(product);
        }
        Ok(products)
    }

    fn contract_exists(&self, id: i64) -> anyhow::Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM contracts WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to check contract existence")
    }

    fn contract_id_by_number(&self, number: &str) -> anyhow::Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM contracts WHERE contract_number = ?1",
                params![number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up contract number")
    }
}

// ── Row plumbing ──────────────────────────────────────────────────────

struct ContractRow {
    id: i64,
    fields: ContractFields,
    sales_employee_id: Option<i64>,
    terms_json: Option<String>,
    process_status_json: Option<String>,
    extra_info_json: Option<String>,
    raw_data_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ContractRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            fields: ContractFields::from_row(row)?,
            sales_employee_id: row.get("sales_employee_id")?,
            terms_json: row.get("terms_json")?,
            process_status_json: row.get("process_status_json")?,
            extra_info_json: row.get("extra_info_json")?,
            raw_data_json: row.get("raw_data_json")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_contract(self, raw_data: Map<String, Value>, products: Vec<ContractProduct>) -> Contract {
        Contract {
            id: self.id,
            terms: decode_bag(self.terms_json.as_deref(), "terms_json", self.id),
            process_status: decode_bag(
                self.process_status_json.as_deref(),
                "process_status_json",
                self.id,
            ),
            extra_info: decode_bag(self.extra_info_json.as_deref(), "extra_info_json", self.id),
            fields: self.fields,
            sales_employee_id: self.sales_employee_id,
            raw_data,
            products,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Supplied scalars plus the always-written sales key and bags.
fn contract_columns(
    contract: &NormalizedContract,
    sales_employee_id: Option<i64>,
) -> anyhow::Result<Vec<(&'static str, SqlValue)>> {
    let mut columns = contract.fields.assigned();
    columns.push((
        "sales_employee_id",
        sales_employee_id.map_or(SqlValue::Null, SqlValue::Integer),
    ));
    columns.push(("terms_json", SqlValue::Text(encode(&contract.terms, "terms")?)));
    columns.push((
        "process_status_json",
        SqlValue::Text(encode(&contract.process_status, "process status")?),
    ));
    columns.push((
        "extra_info_json",
        SqlValue::Text(encode(&contract.extra_info, "extra info")?),
    ));
    columns.push((
        "raw_data_json",
        SqlValue::Text(encode(&contract.raw_payload, "raw payload")?),
    ));
    Ok(columns)
}

/// Product columns to write. The soft type reference is always written so a
/// dropped reference does not survive an update.
fn product_columns(
    product: &NormalizedProduct,
    position: i64,
) -> anyhow::Result<Vec<(&'static str, SqlValue)>> {
    const SOFT_TYPE_COLUMNS: [&str; 3] = ["product_type_id", "product_type_name", "product_type_code"];

    let fields = &product.fields;
    let mut columns = fields.assigned();
    columns.retain(|(c, _)| !SOFT_TYPE_COLUMNS.contains(c));
    for (column, value) in SOFT_TYPE_COLUMNS.into_iter().zip([
        &fields.product_type_id,
        &fields.product_type_name,
        &fields.product_type_code,
    ]) {
        columns.push((column, value.clone().map_or(SqlValue::Null, SqlValue::Text)));
    }
    columns.push(("product_index", SqlValue::Integer(position)));
    columns.push((
        "extra_info_json",
        SqlValue::Text(encode(&product.extra_info, "product extra info")?),
    ));
    Ok(columns)
}

fn insert_product(
    conn: &Connection,
    contract_id: i64,
    position: i64,
    product: &NormalizedProduct,
) -> Result<(), ContractError> {
    let columns = product_columns(product, position)?;
    let sql = format!(
        "INSERT INTO contract_products (contract_id, {}) VALUES (?, {})",
        columns.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", "),
        placeholders(columns.len())
    );
    let values = std::iter::once(SqlValue::Integer(contract_id))
        .chain(columns.into_iter().map(|(_, v)| v));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn update_product(
    conn: &Connection,
    product_id: i64,
    position: i64,
    product: &NormalizedProduct,
) -> Result<(), ContractError> {
    let columns = product_columns(product, position)?;
    let sql = format!(
        "UPDATE contract_products SET {}, updated_at = datetime('now') WHERE id = ?",
        assignments(&columns)
    );
    let values = columns
        .into_iter()
        .map(|(_, v)| v)
        .chain(std::iter::once(SqlValue::Integer(product_id)));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn assignments(columns: &[(&'static str, SqlValue)]) -> String {
    columns
        .iter()
        .map(|(c, _)| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn contract_product_ids(conn: &Connection, contract_id: i64) -> anyhow::Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT id FROM contract_products WHERE contract_id = ?1 ORDER BY product_index, id")
        .context("Failed to prepare contract_product_ids")?;
    let ids = stmt
        .query_map(params![contract_id], |row| row.get(0))
        .context("Failed to query contract product ids")?
        .collect::<rusqlite::Result<Vec<i64>>>()
        .context("Failed to read contract product id")?;
    Ok(ids)
}

fn count_process_records(conn: &Connection, product_ids: &[i64]) -> anyhow::Result<i64> {
    if product_ids.is_empty() {
        return Ok(0);
    }
    conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM process_records WHERE contract_product_id IN ({})",
            placeholders(product_ids.len())
        ),
        params_from_iter(product_ids.iter()),
        |row| row.get(0),
    )
    .context("Failed to count production records")
}

/// When the stored soft reference carries no id, rebuild it from the line
/// item exactly as it was submitted.
fn backfill_product_type(fields: &mut ProductFields, raw_item: Option<&Map<String, Value>>) {
    if fields
        .product_type_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty())
    {
        return;
    }
    let Some(item) = raw_item else {
        return;
    };
    if fields.product_type_id.is_none() {
        fields.product_type_id = pick_text(item, &["productTypeId"]);
    }
    if fields.product_type_name.is_none() {
        fields.product_type_name =
            pick_text(item, &["productTypeName", "productType", "productTypeCode"]);
    }
    if fields.product_type_code.is_none() {
        fields.product_type_code = pick_text(item, &["productTypeCode"]);
    }
}

fn encode<T: Serialize + ?Sized>(value: &T, what: &str) -> anyhow::Result<String> {
    serde_json::to_string(value).with_context(|| format!("Failed to encode {}", what))
}

/// Decode a JSON bag column. Corrupt content decodes as empty.
fn decode_bag<T: DeserializeOwned + Default>(raw: Option<&str>, column: &str, owner_id: i64) -> T {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            warn!(owner_id, column, error = %e, "Corrupt JSON bag, decoding as empty");
            T::default()
        }),
        None => T::default(),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

enum UpperBound {
    Inclusive(String),
    Before(String),
}

fn lower_bound(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(instant) = parse_instant(input) {
        return Some(instant.format(TIMESTAMP_FORMAT).to_string());
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d 00:00:00").to_string())
}

/// A bare date includes the whole day.
fn upper_bound(input: &str) -> Option<UpperBound> {
    let input = input.trim();
    if let Some(instant) = parse_instant(input) {
        return Some(UpperBound::Inclusive(
            instant.format(TIMESTAMP_FORMAT).to_string(),
        ));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").ok()?;
    let next = date.succ_opt()?;
    Some(UpperBound::Before(next.format("%Y-%m-%d 00:00:00").to_string()))
}

/// RFC 3339 (normalized to UTC) or a naive `YYYY-MM-DD HH:MM:SS`.
fn parse_instant(input: &str) -> Option<NaiveDateTime> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Some(instant.with_timezone(&Utc).naive_utc());
    }
    NaiveDateTime::parse_from_str(input, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> ContractDb {
        ContractDb::new_in_memory().unwrap()
    }

    fn with_products(number: &str, names: &[&str]) -> Value {
        let products: Vec<Value> = names.iter().map(|n| json!({"产品名称": n})).collect();
        json!({"合同编号": number, "甲方": "Acme", "products": products})
    }

    fn record_against(db: &ContractDb, contract_product_id: i64) {
        db.create_process_record(&NewProcessRecord {
            contract_product_id,
            process_id: None,
            employee_id: None,
            status: Some(RecordStatus::InProgress),
            actual_time: Some(45),
        })
        .unwrap();
    }

    fn names(contract: &Contract) -> Vec<String> {
        contract
            .products
            .iter()
            .map(|p| p.fields.product_name.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_create_full_bilingual_payload() {
        let db = db();
        let created = db
            .create_contract(json!({
                "contractNumber": "C-1",
                "甲方": "Acme",
                "products": [{"产品名称": "Widget", "quantity": "10"}]
            }))
            .unwrap();

        let fetched = db.get_contract(created.id).unwrap().unwrap();
        assert_eq!(fetched.fields.contract_number.as_deref(), Some("C-1"));
        assert_eq!(fetched.fields.party_a_name.as_deref(), Some("Acme"));
        assert_eq!(fetched.products.len(), 1);
        let product = &fetched.products[0];
        assert_eq!(product.product_index, 1);
        assert_eq!(product.contract_id, created.id);
        assert_eq!(product.fields.product_name.as_deref(), Some("Widget"));
        assert_eq!(product.fields.quantity.as_deref(), Some("10"));
        assert_eq!(fetched.raw_data["甲方"], "Acme");
    }

    #[test]
    fn test_create_round_trips_bags() {
        let db = db();
        let created = db
            .create_contract(json!({
                "合同编号": "C-2",
                "条款二": "Second clause",
                "条款1": "First clause",
                "激光雕刻": "2024-04-02",
                "customerLevel": "gold",
                "是否新图": "是",
                "isReviewed": "maybe",
                "products": [
                    {"productName": "A", "color": "blue", "新木箱": "否"},
                    {"productName": "B"}
                ]
            }))
            .unwrap();

        assert_eq!(created.terms, vec!["First clause", "Second clause"]);
        assert_eq!(created.process_status["laserEngraving"], "2024-04-02");
        assert_eq!(created.extra_info["customerLevel"], "gold");
        assert_eq!(created.fields.is_new_artwork, Some(true));
        assert_eq!(created.fields.is_reviewed, None);
        assert_eq!(created.products[0].extra_info["color"], "blue");
        assert_eq!(created.products[0].fields.new_wood_box, Some(false));
        assert_eq!(names(&created), vec!["A", "B"]);
        assert_eq!(created.products[1].product_index, 2);
    }

    #[test]
    fn test_validation_gate() {
        let db = db();

        let err = db.create_contract(json!({"products": [{"productName": "A"}]})).unwrap_err();
        assert!(matches!(err, ContractError::Validation(_)));

        let err = db.create_contract(json!({"contractNumber": "  ", "productName": "A"})).unwrap_err();
        assert!(matches!(err, ContractError::Validation(_)));

        let err = db.create_contract(json!({"contractNumber": "C-1"})).unwrap_err();
        assert!(matches!(err, ContractError::Validation(_)));

        let eleven: Vec<&str> = vec!["P"; 11];
        let err = db.create_contract(with_products("C-1", &eleven)).unwrap_err();
        assert!(err.to_string().contains("at most 10"));

        let page = db.list_contracts(&ContractQuery::default()).unwrap();
        assert_eq!(page.pagination.total, 0);
    }

    #[test]
    fn test_ten_products_is_allowed() {
        let db = db();
        let ten: Vec<&str> = vec!["P"; 10];
        let created = db.create_contract(with_products("C-10", &ten)).unwrap();
        assert_eq!(created.products.len(), 10);
        assert_eq!(created.products[9].product_index, 10);
    }

    #[test]
    fn test_duplicate_contract_number_conflicts() {
        let db = db();
        let first = db.create_contract(with_products("C-1", &["A"])).unwrap();

        let mut second = with_products("C-1", &["B"]);
        second["甲方"] = json!("Other");
        let err = db.create_contract(second).unwrap_err();
        match err {
            ContractError::DuplicateContractNumber { contract_number } => {
                assert_eq!(contract_number, "C-1")
            }
            other => panic!("Expected DuplicateContractNumber, got {other:?}"),
        }

        let unchanged = db.get_contract(first.id).unwrap().unwrap();
        assert_eq!(unchanged.fields.party_a_name.as_deref(), Some("Acme"));
        assert_eq!(names(&unchanged), vec!["A"]);
    }

    #[test]
    fn test_update_replaces_and_renumbers_products() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A", "B", "C"])).unwrap();
        let c_id = created.products[2].id;

        let updated = db
            .update_contract(
                created.id,
                json!({
                    "合同编号": "C-1",
                    "products": [
                        {"id": c_id, "productName": "C2"},
                        {"productName": "D"}
                    ]
                }),
            )
            .unwrap();

        assert_eq!(names(&updated), vec!["C2", "D"]);
        assert_eq!(updated.products[0].id, c_id);
        assert_eq!(updated.products[0].product_index, 1);
        assert_eq!(updated.products[1].product_index, 2);
        // Omitted scalars keep their stored value.
        assert_eq!(updated.fields.party_a_name.as_deref(), Some("Acme"));
    }

    #[test]
    fn test_update_blocked_by_production_record() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A", "B"])).unwrap();
        let (a, b) = (created.products[0].id, created.products[1].id);
        record_against(&db, a);

        let err = db
            .update_contract(
                created.id,
                json!({
                    "合同编号": "C-1",
                    "甲方": "Changed",
                    "products": [{"id": b, "productName": "B2"}, {"productName": "New"}]
                }),
            )
            .unwrap_err();
        match err {
            ContractError::ProductInUse {
                product_ids,
                reference_count,
            } => {
                assert_eq!(product_ids, vec![a]);
                assert_eq!(reference_count, 1);
            }
            other => panic!("Expected ProductInUse, got {other:?}"),
        }

        // Whole update rolled back.
        let unchanged = db.get_contract(created.id).unwrap().unwrap();
        assert_eq!(unchanged.fields.party_a_name.as_deref(), Some("Acme"));
        assert_eq!(names(&unchanged), vec!["A", "B"]);
        assert_eq!(unchanged.products[0].id, a);
    }

    #[test]
    fn test_update_keeping_referenced_product_succeeds() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A", "B"])).unwrap();
        let a = created.products[0].id;
        record_against(&db, a);

        let updated = db
            .update_contract(
                created.id,
                json!({"合同编号": "C-1", "products": [{"productName": "Z"}, {"id": a, "productName": "A"}]}),
            )
            .unwrap();
        assert_eq!(names(&updated), vec!["Z", "A"]);
        assert_eq!(updated.products[1].id, a);
        assert_eq!(updated.products[1].product_index, 2);
    }

    #[test]
    fn test_update_repeated_or_foreign_ids_insert_new_rows() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A"])).unwrap();
        let other = db.create_contract(with_products("C-2", &["X"])).unwrap();
        let a = created.products[0].id;

        let updated = db
            .update_contract(
                created.id,
                json!({"合同编号": "C-1", "products": [
                    {"id": a, "productName": "A"},
                    {"id": a, "productName": "A copy"},
                    {"id": other.products[0].id, "productName": "Foreign"},
                    {"id": "tmp-1", "productName": "Opaque"}
                ]}),
            )
            .unwrap();

        assert_eq!(updated.products.len(), 4);
        assert_eq!(updated.products[0].id, a);
        let ids: HashSet<i64> = updated.products.iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 4);
        // The other contract is untouched.
        let other = db.get_contract(other.id).unwrap().unwrap();
        assert_eq!(names(&other), vec!["X"]);
    }

    #[test]
    fn test_update_not_found_and_number_conflict() {
        let db = db();
        let err = db.update_contract(99, with_products("C-1", &["A"])).unwrap_err();
        assert!(matches!(err, ContractError::ContractNotFound { id: 99 }));

        db.create_contract(with_products("C-1", &["A"])).unwrap();
        let second = db.create_contract(with_products("C-2", &["B"])).unwrap();
        let err = db.update_contract(second.id, with_products("C-1", &["B"])).unwrap_err();
        assert!(matches!(err, ContractError::DuplicateContractNumber { .. }));

        // Renaming to a free number is fine.
        let renamed = db.update_contract(second.id, with_products("C-3", &["B"])).unwrap();
        assert_eq!(renamed.fields.contract_number.as_deref(), Some("C-3"));
    }

    #[test]
    fn test_fetched_contract_resubmits_cleanly() {
        let db = db();
        let created = db
            .create_contract(json!({
                "合同编号": "C-1",
                "customerLevel": "gold",
                "条款一": "Net 30",
                "包装出库": "done",
                "products": [{"产品名称": "A", "color": "red"}]
            }))
            .unwrap();

        let echoed = serde_json::to_value(&created).unwrap();
        let updated = db.update_contract(created.id, echoed).unwrap();

        assert_eq!(updated.extra_info, created.extra_info);
        assert_eq!(updated.terms, created.terms);
        assert_eq!(updated.process_status, created.process_status);
        assert_eq!(updated.products.len(), 1);
        assert_eq!(updated.products[0].id, created.products[0].id);
        assert_eq!(updated.products[0].extra_info, created.products[0].extra_info);
        assert_eq!(updated.products[0].fields, created.products[0].fields);
    }

    #[test]
    fn test_delete_contract() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A", "B"])).unwrap();

        let summary = db.delete_contract(created.id, false).unwrap();
        assert_eq!(summary.product_count, 2);
        assert_eq!(summary.process_record_count, 0);
        assert!(db.get_contract(created.id).unwrap().is_none());

        let remaining: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM contract_products", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);

        let err = db.delete_contract(created.id, false).unwrap_err();
        assert!(matches!(err, ContractError::ContractNotFound { .. }));
    }

    #[test]
    fn test_delete_blocked_then_forced() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A", "B"])).unwrap();
        record_against(&db, created.products[1].id);
        record_against(&db, created.products[1].id);

        let err = db.delete_contract(created.id, false).unwrap_err();
        match err {
            ContractError::ContractInUse {
                product_ids,
                process_record_count,
            } => {
                assert_eq!(product_ids.len(), 2);
                assert_eq!(process_record_count, 2);
            }
            other => panic!("Expected ContractInUse, got {other:?}"),
        }
        assert!(db.get_contract(created.id).unwrap().is_some());

        let summary = db.delete_contract(created.id, true).unwrap();
        assert_eq!(summary.process_record_count, 2);
        assert!(db.get_contract(created.id).unwrap().is_none());
        let records: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM process_records", [], |r| r.get(0))
            .unwrap();
        assert_eq!(records, 0);
    }

    #[test]
    fn test_import_collects_per_record_failures() {
        let db = db();
        let report = db
            .import_contracts(json!({"contracts": [
                with_products("C-1", &["A"]),
                with_products("C-2", &["B"]),
                with_products("C-1", &["dup"])
            ]}))
            .unwrap();

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert!(!report.is_clean());
        assert_eq!(report.errors[0].index, 2);
        assert_eq!(report.errors[0].contract_number.as_deref(), Some("C-1"));
        assert_eq!(report.contracts.len(), 2);
    }

    #[test]
    fn test_import_accepts_bare_array_and_reports_invalid_records() {
        let db = db();
        let report = db
            .import_contracts(json!([
                {"产品名称": "no number"},
                with_products("C-9", &["A"])
            ]))
            .unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.errors[0].index, 0);
        assert_eq!(report.errors[0].contract_number, None);
    }

    #[test]
    fn test_import_wraps_single_record() {
        let db = db();
        let report = db
            .import_contracts(json!({"contracts": with_products("C-5", &["A"])}))
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.success_count, 1);
        assert_eq!(
            report.contracts[0].fields.contract_number.as_deref(),
            Some("C-5")
        );
    }

    #[test]
    fn test_import_requires_records() {
        let db = db();
        for body in [json!({}), json!({"contracts": []}), json!("nope")] {
            let err = db.import_contracts(body).unwrap_err();
            assert!(matches!(err, ContractError::Validation(_)));
        }
    }

    #[test]
    fn test_sales_reference_resolved_on_create() {
        let db = db();
        let employee = db
            .create_employee(&NewEmployee {
                name: Some("Li Lei".into()),
                code: Some("S001".into()),
                status: None,
            })
            .unwrap();

        let mut payload = with_products("C-1", &["A"]);
        payload["销售ID"] = json!(employee.id);
        let created = db.create_contract(payload).unwrap();
        assert_eq!(created.sales_employee_id, Some(employee.id));
        assert_eq!(created.fields.sales_id.as_deref(), Some("S001"));

        let mut payload = with_products("C-2", &["A"]);
        payload["salesId"] = json!("Unknown Rep");
        let created = db.create_contract(payload).unwrap();
        assert_eq!(created.sales_employee_id, None);
        assert_eq!(created.fields.sales_id.as_deref(), Some("Unknown Rep"));
    }

    #[test]
    fn test_product_type_resolved_on_create() {
        let db = db();
        db.create_product_type(&NewProductType {
            name: "Anilox".into(),
            ..Default::default()
        })
        .unwrap();

        let created = db
            .create_contract(json!({"合同编号": "C-1", "products": [
                {"productName": "A", "productTypeName": "Anilox"},
                {"productName": "B", "productTypeName": "Sleeve"}
            ]}))
            .unwrap();
        let first = &created.products[0].fields;
        assert_eq!(first.product_type_id.as_deref(), Some("1"));
        assert_eq!(first.product_type_code.as_deref(), Some("PT001"));
        let second = &created.products[1].fields;
        assert_eq!(second.product_type_id, None);
        assert_eq!(second.product_type_name.as_deref(), Some("Sleeve"));
    }

    #[test]
    fn test_read_backfills_product_type_from_raw_payload() {
        let db = db();
        let created = db
            .create_contract(json!({"合同编号": "C-1", "products": [
                {"productName": "A", "productType": "Legacy sleeve"}
            ]}))
            .unwrap();
        let fields = &created.products[0].fields;
        assert_eq!(fields.product_type_name.as_deref(), Some("Legacy sleeve"));
        assert_eq!(fields.product_type_id, None);
    }

    #[test]
    fn test_corrupt_bag_decodes_empty() {
        let db = db();
        let created = db.create_contract(with_products("C-1", &["A"])).unwrap();
        db.conn
            .execute(
                "UPDATE contracts SET terms_json = 'not json', extra_info_json = '[1' WHERE id = ?1",
                params![created.id],
            )
            .unwrap();

        let fetched = db.get_contract(created.id).unwrap().unwrap();
        assert!(fetched.terms.is_empty());
        assert!(fetched.extra_info.is_empty());
    }

    #[test]
    fn test_list_filters_and_pagination() {
        let db = db();
        let mut first = with_products("HZ-001", &["A"]);
        first["合同状态"] = json!("signed");
        first["销售ID"] = json!("Zhang San");
        db.create_contract(first).unwrap();
        db.create_contract(with_products("HZ-002", &["A"])).unwrap();
        let mut third = with_products("SH-003", &["A"]);
        third["乙方"] = json!("Hangzhou Rolls");
        db.create_contract(third).unwrap();

        let all = db.list_contracts(&ContractQuery::default()).unwrap();
        assert_eq!(all.pagination.total, 3);
        // Newest first.
        assert_eq!(all.items[0].fields.contract_number.as_deref(), Some("SH-003"));

        let by_status = db
            .list_contracts(&ContractQuery {
                status: Some("signed".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_status.pagination.total, 1);

        let by_keyword = db
            .list_contracts(&ContractQuery {
                keyword: Some("Hangzhou".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_keyword.pagination.total, 1);

        let by_sales = db
            .list_contracts(&ContractQuery {
                sales_id: Some("Zhang".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_sales.pagination.total, 1);

        let page_two = db
            .list_contracts(&ContractQuery {
                page: Some(2),
                page_size: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page_two.pagination.total, 3);
        assert_eq!(page_two.pagination.page, 2);
        assert_eq!(page_two.items.len(), 1);
        assert_eq!(page_two.items[0].fields.contract_number.as_deref(), Some("HZ-001"));
    }

    #[test]
    fn test_list_date_bounds() {
        let db = db();
        let jan = db.create_contract(with_products("C-JAN", &["A"])).unwrap();
        let feb = db.create_contract(with_products("C-FEB", &["A"])).unwrap();
        db.conn
            .execute(
                "UPDATE contracts SET created_at = '2024-01-31 23:59:59' WHERE id = ?1",
                params![jan.id],
            )
            .unwrap();
        db.conn
            .execute(
                "UPDATE contracts SET created_at = '2024-02-01 00:00:00' WHERE id = ?1",
                params![feb.id],
            )
            .unwrap();

        let through_jan = db
            .list_contracts(&ContractQuery {
                date_to: Some("2024-01-31".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(through_jan.pagination.total, 1);
        assert_eq!(through_jan.items[0].id, jan.id);

        let from_feb = db
            .list_contracts(&ContractQuery {
                date_from: Some("2024-02-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(from_feb.pagination.total, 1);
        assert_eq!(from_feb.items[0].id, feb.id);

        let ignored = db
            .list_contracts(&ContractQuery {
                date_from: Some("last tuesday".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ignored.pagination.total, 2);
    }

    #[test]
    fn test_date_bound_parsing() {
        assert_eq!(lower_bound("2024-03-05").as_deref(), Some("2024-03-05 00:00:00"));
        assert_eq!(
            lower_bound("2024-03-05T10:00:00+08:00").as_deref(),
            Some("2024-03-05 02:00:00")
        );
        assert!(matches!(
            upper_bound("2024-12-31"),
            Some(UpperBound::Before(ref s)) if s == "2025-01-01 00:00:00"
        ));
        assert!(matches!(
            upper_bound("2024-12-31 08:30:00"),
            Some(UpperBound::Inclusive(ref s)) if s == "2024-12-31 08:30:00"
        ));
        assert!(upper_bound("31/12/2024").is_none());
    }
}
