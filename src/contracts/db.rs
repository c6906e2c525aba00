use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::ContractError;

/// Async-safe handle to the contract database.
///
/// Wraps `ContractDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ContractDb>>,
}

impl DbHandle {
    pub fn new(db: ContractDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, ContractError>
    where
        F: FnOnce(&ContractDb) -> Result<R, ContractError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| ContractError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct ContractDb {
    pub(super) conn: Connection,
}

impl ContractDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS employees (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT,
                    code TEXT UNIQUE,
                    status TEXT DEFAULT 'active',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS processes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    code TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS product_types (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    code TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS product_type_processes (
                    product_type_id INTEGER NOT NULL REFERENCES product_types(id) ON DELETE CASCADE,
                    process_id INTEGER NOT NULL REFERENCES processes(id) ON DELETE CASCADE,
                    sequence_order INTEGER NOT NULL,
                    PRIMARY KEY (product_type_id, process_id)
                );

                CREATE TABLE IF NOT EXISTS contracts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    contract_number TEXT NOT NULL UNIQUE,
                    party_a_name TEXT,
                    party_a_company_name TEXT,
                    party_a_address TEXT,
                    party_a_contact TEXT,
                    party_a_phone_fax TEXT,
                    party_a_bank TEXT,
                    party_a_bank_account TEXT,
                    party_a_bank_no TEXT,
                    party_a_tax_number TEXT,
                    party_b_name TEXT,
                    party_b_company_name TEXT,
                    party_b_address TEXT,
                    party_b_contact TEXT,
                    party_b_phone_fax TEXT,
                    party_b_bank TEXT,
                    party_b_bank_account TEXT,
                    party_b_bank_no TEXT,
                    party_b_tax_number TEXT,
                    signed_date TEXT,
                    signed_location TEXT,
                    status TEXT,
                    contract_attribute TEXT,
                    delivery_deadline TEXT,
                    actual_delivery_date TEXT,
                    settlement_date TEXT,
                    payment_status TEXT,
                    payment_date TEXT,
                    shipping_date TEXT,
                    sales_id TEXT,
                    remark TEXT,
                    is_new_artwork INTEGER,
                    is_reviewed INTEGER,
                    is_scheduled INTEGER,
                    terms_json TEXT NOT NULL DEFAULT '[]',
                    process_status_json TEXT NOT NULL DEFAULT '{}',
                    extra_info_json TEXT NOT NULL DEFAULT '{}',
                    raw_data_json TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contract_products (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    contract_id INTEGER NOT NULL REFERENCES contracts(id) ON DELETE CASCADE,
                    product_index INTEGER NOT NULL,
                    product_id TEXT,
                    product_code TEXT,
                    product_name TEXT,
                    specification TEXT,
                    carve_width TEXT,
                    mesh_type TEXT,
                    line_count TEXT,
                    volume_ratio TEXT,
                    ink_volume TEXT,
                    quantity TEXT,
                    unit_price TEXT,
                    plate_unit_price TEXT,
                    total_amount TEXT,
                    product_type_id TEXT,
                    product_type_name TEXT,
                    extra_info_json TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS process_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    contract_product_id INTEGER NOT NULL,
                    process_id INTEGER,
                    employee_id INTEGER,
                    status TEXT NOT NULL DEFAULT 'pending',
                    actual_time INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_contracts_created ON contracts(created_at);
                CREATE INDEX IF NOT EXISTS idx_contract_products_contract ON contract_products(contract_id);
                CREATE INDEX IF NOT EXISTS idx_process_records_product ON process_records(contract_product_id);
                ",
            )
            .context("Failed to create tables")?;

        // Columns added after the first schema; nullable, safe to re-run.
        self.add_column("contracts", "sales_employee_id INTEGER")?;
        self.add_column("contracts", "ink_capacity TEXT")?;
        self.add_column("contracts", "cell_shape TEXT")?;
        self.add_column("contract_products", "product_type_code TEXT")?;
        self.add_column("contract_products", "cell_shape TEXT")?;
        self.add_column("contract_products", "new_wood_box INTEGER")?;

        Ok(())
    }

    /// We only ignore "duplicate column" errors; anything else is propagated.
    fn add_column(&self, table: &str, definition: &str) -> Result<()> {
        match self
            .conn
            .execute(&format!("ALTER TABLE {table} ADD COLUMN {definition}"), [])
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column") => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to add column {} to {}: {}",
                definition,
                table,
                e
            )),
        }
    }

    // ── Employees ─────────────────────────────────────────────────────

    pub fn create_employee(&self, new: &NewEmployee) -> Result<Employee, ContractError> {
        let name = non_blank(new.name.as_deref());
        let code = non_blank(new.code.as_deref());
        if name.is_none() && code.is_none() {
            return Err(ContractError::Validation(
                "Employee name or code is required".into(),
            ));
        }
        let status = non_blank(new.status.as_deref()).unwrap_or("active");
        match self.conn.execute(
            "INSERT INTO employees (name, code, status) VALUES (?1, ?2, ?3)",
            params![name, code, status],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ContractError::DuplicateCode {
                    entity: "Employee",
                    code: code.unwrap_or_default().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_employee(id)?
            .context("Employee not found after insert")?)
    }

    pub fn list_employees(&self) -> Result<Vec<Employee>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, code, status, created_at FROM employees ORDER BY id")
            .context("Failed to prepare list_employees")?;
        let rows = stmt
            .query_map([], employee_from_row)
            .context("Failed to query employees")?;
        let mut employees = Vec::new();
        for row in rows {
            employees.push(row.context("Failed to read employee row")?);
        }
        Ok(employees)
    }

    pub fn get_employee(&self, id: i64) -> Result<Option<Employee>> {
        self.conn
            .query_row(
                "SELECT id, name, code, status, created_at FROM employees WHERE id = ?1",
                params![id],
                employee_from_row,
            )
            .optional()
            .context("Failed to query employee")
    }

    // ── Processes ─────────────────────────────────────────────────────

    pub fn create_process(&self, new: &NewProcess) -> Result<Process, ContractError> {
        let name = non_blank(Some(&new.name))
            .ok_or_else(|| ContractError::Validation("Process name is required".into()))?;
        let code = non_blank(Some(&new.code))
            .ok_or_else(|| ContractError::Validation("Process code is required".into()))?;
        match self.conn.execute(
            "INSERT INTO processes (name, code) VALUES (?1, ?2)",
            params![name, code],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ContractError::DuplicateCode {
                    entity: "Process",
                    code: code.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_process(id)?
            .context("Process not found after insert")?)
    }

    pub fn list_processes(&self) -> Result<Vec<Process>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, code, created_at FROM processes ORDER BY id")
            .context("Failed to prepare list_processes")?;
        let rows = stmt
            .query_map([], process_from_row)
            .context("Failed to query processes")?;
        let mut processes = Vec::new();
        for row in rows {
            processes.push(row.context("Failed to read process row")?);
        }
        Ok(processes)
    }

    pub fn get_process(&self, id: i64) -> Result<Option<Process>> {
        self.conn
            .query_row(
                "SELECT id, name, code, created_at FROM processes WHERE id = ?1",
                params![id],
                process_from_row,
            )
            .optional()
            .context("Failed to query process")
    }

    // ── Product types ─────────────────────────────────────────────────

    /// Create a product type and attach its processes in the given order.
    pub fn create_product_type(
        &self,
        new: &NewProductType,
    ) -> Result<ProductTypeDetail, ContractError> {
        let name = non_blank(Some(&new.name))
            .ok_or_else(|| ContractError::Validation("Product type name is required".into()))?;

        let mut seen = HashSet::new();
        for process_id in &new.process_ids {
            if !seen.insert(*process_id) {
                return Err(ContractError::Validation(format!(
                    "Process {} is listed more than once",
                    process_id
                )));
            }
            if self.get_process(*process_id)?.is_none() {
                return Err(ContractError::Validation(format!(
                    "Process {} not found",
                    process_id
                )));
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        let code = match non_blank(new.code.as_deref()) {
            Some(code) => code.to_string(),
            None => next_product_type_code(&tx)?,
        };
        let status = non_blank(new.status.as_deref()).unwrap_or("active");
        match tx.execute(
            "INSERT INTO product_types (name, code, status) VALUES (?1, ?2, ?3)",
            params![name, code, status],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ContractError::DuplicateCode {
                    entity: "Product type",
                    code,
                });
            }
            Err(e) => return Err(e.into()),
        }
        let id = tx.last_insert_rowid();
        for (position, process_id) in new.process_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO product_type_processes (product_type_id, process_id, sequence_order)
                 VALUES (?1, ?2, ?3)",
                params![id, process_id, position as i64 + 1],
            )?;
        }
        tx.commit()?;

        Ok(self
            .get_product_type(id)?
            .context("Product type not found after insert")?)
    }

    pub fn list_product_types(&self) -> Result<Vec<ProductTypeDetail>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, code, status, created_at FROM product_types ORDER BY id")
            .context("Failed to prepare list_product_types")?;
        let rows = stmt
            .query_map([], product_type_from_row)
            .context("Failed to query product types")?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row.context("Failed to read product type row")?);
        }
        types
            .into_iter()
            .map(|product_type| {
                let processes = self.product_type_steps(product_type.id)?;
                Ok(ProductTypeDetail {
                    product_type,
                    processes,
                })
            })
            .collect()
    }

    pub fn get_product_type(&self, id: i64) -> Result<Option<ProductTypeDetail>> {
        let product_type = self
            .conn
            .query_row(
                "SELECT id, name, code, status, created_at FROM product_types WHERE id = ?1",
                params![id],
                product_type_from_row,
            )
            .optional()
            .context("Failed to query product type")?;
        match product_type {
            Some(product_type) => {
                let processes = self.product_type_steps(id)?;
                Ok(Some(ProductTypeDetail {
                    product_type,
                    processes,
                }))
            }
            None => Ok(None),
        }
    }

    fn product_type_steps(&self, product_type_id: i64) -> Result<Vec<ProductTypeStep>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id, p.name, p.code, p.created_at, ptp.sequence_order
                 FROM product_type_processes ptp
                 JOIN processes p ON p.id = ptp.process_id
                 WHERE ptp.product_type_id = ?1
                 ORDER BY ptp.sequence_order",
            )
            .context("Failed to prepare product_type_steps")?;
        let rows = stmt
            .query_map(params![product_type_id], |row| {
                Ok(ProductTypeStep {
                    process: process_from_row(row)?,
                    sequence_order: row.get(4)?,
                })
            })
            .context("Failed to query product type processes")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read product type process row")?);
        }
        Ok(steps)
    }

    // ── Production records ────────────────────────────────────────────

    pub fn create_process_record(
        &self,
        new: &NewProcessRecord,
    ) -> Result<ProcessRecord, ContractError> {
        let product_exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM contract_products WHERE id = ?1)",
            params![new.contract_product_id],
            |row| row.get(0),
        )?;
        if !product_exists {
            return Err(ContractError::Validation(format!(
                "Contract product {} not found",
                new.contract_product_id
            )));
        }
        if let Some(process_id) = new.process_id {
            if self.get_process(process_id)?.is_none() {
                return Err(ContractError::Validation(format!(
                    "Process {} not found",
                    process_id
                )));
            }
        }
        let status = new.status.clone().unwrap_or(RecordStatus::Pending);
        self.conn.execute(
            "INSERT INTO process_records (contract_product_id, process_id, employee_id, status, actual_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.contract_product_id,
                new.process_id,
                new.employee_id,
                status.as_str(),
                new.actual_time
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_process_record(id)?
            .context("Process record not found after insert")?)
    }

    pub fn get_process_record(&self, id: i64) -> Result<Option<ProcessRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, contract_product_id, process_id, employee_id, status, actual_time, created_at
                 FROM process_records WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query process record")?;
        let Some((id, contract_product_id, process_id, employee_id, status, actual_time, created_at)) =
            row
        else {
            return Ok(None);
        };
        let status = status
            .parse::<RecordStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Some(ProcessRecord {
            id,
            contract_product_id,
            process_id,
            employee_id,
            status,
            actual_time,
            created_at,
        }))
    }
}

/// Allocate the next free `PTnnn` code, starting after the current row count.
fn next_product_type_code(conn: &Connection) -> Result<String> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM product_types", [], |row| row.get(0))
        .context("Failed to count product types")?;
    let mut ordinal = count + 1;
    loop {
        let code = format!("PT{:03}", ordinal);
        let taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM product_types WHERE code = ?1)",
                params![code],
                |row| row.get(0),
            )
            .context("Failed to check product type code")?;
        if !taken {
            return Ok(code);
        }
        ordinal += 1;
    }
}

pub(super) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub(super) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn employee_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn process_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Process> {
    Ok(Process {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub(super) fn product_type_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductType> {
    Ok(ProductType {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}
