//! Raw payload → canonical contract records.
//!
//! Normalization never fails. Whether the result is complete enough to
//! persist is decided by the validation gate in `store`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Serialize;
use serde_json::{Map, Value};

use super::aliases::{
    KNOWN_CONTRACT_KEYS, KNOWN_PRODUCT_KEYS, PROCESS_CHECKPOINTS, PRODUCT_LIST_KEYS, TERM_CLAUSES,
    pick_first, pick_text,
};
use super::coerce::{normalize_text, parse_id};
use super::models::{ContractFields, ProductFields};

static EMPTY_ITEM: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);

/// Identifier a line item carried in. Only numeric ids can match stored rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LineItemId {
    Numeric(i64),
    Opaque(String),
}

impl LineItemId {
    fn from_value(value: &Value) -> Option<Self> {
        if let Some(id) = parse_id(value) {
            return Some(Self::Numeric(id));
        }
        normalize_text(value).map(Self::Opaque)
    }

    pub fn numeric(&self) -> Option<i64> {
        match self {
            Self::Numeric(id) => Some(*id),
            Self::Opaque(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedProduct {
    /// 1-based position in submission order.
    pub product_index: i64,
    pub id: Option<LineItemId>,
    #[serde(flatten)]
    pub fields: ProductFields,
    pub extra_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedContract {
    #[serde(flatten)]
    pub fields: ContractFields,
    pub terms: Vec<String>,
    pub process_status: BTreeMap<String, String>,
    pub extra_info: Map<String, Value>,
    pub products: Vec<NormalizedProduct>,
    pub raw_payload: Map<String, Value>,
}

impl NormalizedContract {
    /// Normalize any JSON value; non-objects normalize as an empty payload.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_payload(map),
            _ => Self::from_payload(Map::new()),
        }
    }

    pub fn from_payload(payload: Map<String, Value>) -> Self {
        let fields = ContractFields::resolve(&payload);
        let terms = collect_terms(&payload);
        let process_status = collect_process_status(&payload);
        let products = line_items(&payload)
            .into_iter()
            .enumerate()
            .map(|(index, item)| normalize_product(item, index as i64 + 1))
            .collect();
        let extra_info = collect_extra(&payload, |key| KNOWN_CONTRACT_KEYS.contains(key));

        Self {
            fields,
            terms,
            process_status,
            extra_info,
            products,
            raw_payload: payload,
        }
    }

    pub fn contract_number(&self) -> Option<&str> {
        self.fields.contract_number.as_deref()
    }
}

fn collect_terms(payload: &Map<String, Value>) -> Vec<String> {
    if let Some(Value::Array(items)) = payload.get("terms") {
        return items.iter().filter_map(normalize_text).collect();
    }
    TERM_CLAUSES
        .iter()
        .filter_map(|aliases| pick_text(payload, aliases))
        .collect()
}

fn collect_process_status(payload: &Map<String, Value>) -> BTreeMap<String, String> {
    let nested = match payload.get("processStatus") {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };
    PROCESS_CHECKPOINTS
        .iter()
        .filter_map(|checkpoint| {
            let text = pick_text(payload, checkpoint.aliases)
                .or_else(|| nested.and_then(|n| pick_text(n, checkpoint.aliases)))?;
            Some((checkpoint.name.to_string(), text))
        })
        .collect()
}

/// The first product-list key holding an array wins. Without one, a payload
/// that names a product at top level is its own single line item.
pub(crate) fn line_items(payload: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    for key in PRODUCT_LIST_KEYS {
        if let Some(Value::Array(items)) = payload.get(*key) {
            return items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => map,
                    _ => &*EMPTY_ITEM,
                })
                .collect();
        }
    }
    let names_product = ProductFields::ALIASES
        .iter()
        .find(|f| f.name == "product_name")
        .is_some_and(|f| pick_first(payload, f.aliases).is_some());
    if names_product { vec![payload] } else { Vec::new() }
}

fn normalize_product(source: &Map<String, Value>, product_index: i64) -> NormalizedProduct {
    NormalizedProduct {
        product_index,
        id: source.get("id").and_then(LineItemId::from_value),
        fields: ProductFields::resolve(source),
        extra_info: collect_extra(source, |key| KNOWN_PRODUCT_KEYS.contains(key)),
    }
}

/// Keys rejected by `is_known`, plus the entries of an echoed `extraInfo`
/// object. Keys sent at top level win over echoed ones.
fn collect_extra(source: &Map<String, Value>, is_known: impl Fn(&str) -> bool) -> Map<String, Value> {
    let mut extra = match source.get("extraInfo") {
        Some(Value::Object(echoed)) => echoed.clone(),
        _ => Map::new(),
    };
    for (key, value) in source {
        if !is_known(key) {
            extra.insert(key.clone(), value.clone());
        }
    }
    extra
}
