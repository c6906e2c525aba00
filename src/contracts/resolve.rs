//! Soft-reference resolution against reference data.
//!
//! Both resolvers run inside the caller's transaction and never fail on a
//! miss: an unmatched reference is kept exactly as submitted.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::db::product_type_from_row;
use super::models::{ContractFields, ProductFields, ProductType};
use super::normalize::NormalizedProduct;

const PRODUCT_TYPE_COLUMNS: &str = "id, name, code, status, created_at";

/// Lookups made during one persistence call. Misses are cached as `None`.
#[derive(Debug, Default)]
pub struct ProductTypeCache {
    by_id: HashMap<i64, Option<ProductType>>,
    by_code: HashMap<String, Option<ProductType>>,
    by_name: HashMap<String, Option<ProductType>>,
    queries: usize,
}

impl ProductTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of catalog queries issued so far.
    pub fn queries(&self) -> usize {
        self.queries
    }

    /// Numeric id first, then code, then name. First hit wins.
    pub fn lookup(&mut self, conn: &Connection, fields: &ProductFields) -> Result<Option<ProductType>> {
        if let Some(id) = fields
            .product_type_id
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
        {
            if let Some(hit) = self.by_id(conn, id)? {
                return Ok(Some(hit));
            }
        }
        if let Some(code) = fields.product_type_code.as_deref() {
            if let Some(hit) = self.by_column(conn, Column::Code, code)? {
                return Ok(Some(hit));
            }
        }
        if let Some(name) = fields.product_type_name.as_deref() {
            if let Some(hit) = self.by_column(conn, Column::Name, name)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    fn by_id(&mut self, conn: &Connection, id: i64) -> Result<Option<ProductType>> {
        if let Some(cached) = self.by_id.get(&id) {
            return Ok(cached.clone());
        }
        self.queries += 1;
        let found = conn
            .query_row(
                &format!("SELECT {PRODUCT_TYPE_COLUMNS} FROM product_types WHERE id = ?1"),
                params![id],
                product_type_from_row,
            )
            .optional()
            .context("Failed to look up product type by id")?;
        self.by_id.insert(id, found.clone());
        Ok(found)
    }

    fn by_column(&mut self, conn: &Connection, column: Column, key: &str) -> Result<Option<ProductType>> {
        let cache = match column {
            Column::Code => &mut self.by_code,
            Column::Name => &mut self.by_name,
        };
        if let Some(cached) = cache.get(key) {
            return Ok(cached.clone());
        }
        self.queries += 1;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {PRODUCT_TYPE_COLUMNS} FROM product_types WHERE {} = ?1 ORDER BY id LIMIT 1",
                    column.as_str()
                ),
                params![key],
                product_type_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up product type by {}", column.as_str()))?;
        cache.insert(key.to_string(), found.clone());
        Ok(found)
    }
}

#[derive(Clone, Copy)]
enum Column {
    Code,
    Name,
}

impl Column {
    fn as_str(self) -> &'static str {
        match self {
            Column::Code => "code",
            Column::Name => "name",
        }
    }
}

/// Replace each line item's soft product-type reference with the catalog
/// triple when one matches.
pub fn resolve_product_types(
    conn: &Connection,
    cache: &mut ProductTypeCache,
    products: &mut [NormalizedProduct],
) -> Result<()> {
    for product in products.iter_mut() {
        if let Some(hit) = cache.lookup(conn, &product.fields)? {
            product.fields.product_type_id = Some(hit.id.to_string());
            product.fields.product_type_name = Some(hit.name);
            product.fields.product_type_code = Some(hit.code);
        }
    }
    Ok(())
}

/// Resolve the free-text sales identifier to an employee key.
///
/// On a hit the stored identifier becomes the employee's code (or its id as
/// text when the employee has no code). On a miss the text is left alone.
pub fn resolve_sales_reference(conn: &Connection, fields: &mut ContractFields) -> Result<Option<i64>> {
    let Some(sales_id) = fields.sales_id.as_deref().map(str::trim) else {
        return Ok(None);
    };
    if sales_id.is_empty() {
        return Ok(None);
    }

    let hit: Option<(i64, Option<String>)> = match sales_id.parse::<i64>() {
        Ok(numeric) => conn
            .query_row(
                "SELECT id, code FROM employees WHERE id = ?1 OR code = ?2
                 ORDER BY (id = ?1) DESC, id LIMIT 1",
                params![numeric, sales_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional(),
        Err(_) => conn
            .query_row(
                "SELECT id, code FROM employees WHERE code = ?1 ORDER BY id LIMIT 1",
                params![sales_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional(),
    }
    .context("Failed to look up sales employee")?;

    Ok(hit.map(|(id, code)| {
        let code = code.filter(|c| !c.trim().is_empty());
        fields.sales_id = Some(code.unwrap_or_else(|| id.to_string()));
        id
    }))
}
