//! Field alias tables and first-match probing.
//!
//! Every canonical record is declared once through `canonical_record!`,
//! which produces the struct, its ordered alias table, the resolver that
//! probes a raw payload, and the SQL binding helpers. The "known key"
//! allowlists used to build extra-info bags are derived from those same
//! tables, so a recognised alias can never leak into a bag.

use std::collections::HashSet;
use std::sync::LazyLock;

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::coerce::{normalize_boolean, normalize_text};

/// A canonical field and the input keys that may supply it, in probe order.
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
}

/// Return the first alias whose value is present: not null, and for strings
/// not blank after trimming.
pub fn pick_first<'a>(source: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|key| match source.get(*key)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        value => Some(value),
    })
}

/// `pick_first` followed by text normalization.
pub fn pick_text(source: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    pick_first(source, aliases).and_then(normalize_text)
}

macro_rules! canonical_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            text { $( $tfield:ident => [$($talias:literal),+ $(,)?] ),+ $(,)? }
            flags { $( $bfield:ident => [$($balias:literal),+ $(,)?] ),* $(,)? }
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $tfield: Option<String>,
            )+
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $bfield: Option<bool>,
            )*
        }

        impl $name {
            /// Column name → accepted input keys, in declared probe order.
            pub const ALIASES: &'static [FieldAliases] = &[
                $( FieldAliases { name: stringify!($tfield), aliases: &[$($talias),+] }, )+
                $( FieldAliases { name: stringify!($bfield), aliases: &[$($balias),+] }, )*
            ];

            /// Probe `source` for every canonical field. Flags go through the
            /// boolean vocabulary; unrecognised tokens leave the flag unset.
            pub fn resolve(source: &Map<String, Value>) -> Self {
                Self {
                    $( $tfield: pick_text(source, &[$($talias),+]), )+
                    $( $bfield: pick_first(source, &[$($balias),+]).and_then(normalize_boolean), )*
                }
            }

            /// Columns holding a value, paired with their SQL value.
            pub fn assigned(&self) -> Vec<(&'static str, SqlValue)> {
                let mut out = Vec::new();
                $(
                    if let Some(v) = &self.$tfield {
                        out.push((stringify!($tfield), SqlValue::Text(v.clone())));
                    }
                )+
                $(
                    if let Some(v) = self.$bfield {
                        out.push((stringify!($bfield), SqlValue::Integer(i64::from(v))));
                    }
                )*
                out
            }

            /// Comma-separated column list for SELECT statements.
            pub fn select_list() -> String {
                Self::ALIASES.iter().map(|f| f.name).collect::<Vec<_>>().join(", ")
            }

            pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    $( $tfield: row.get(stringify!($tfield))?, )+
                    $( $bfield: row.get(stringify!($bfield))?, )*
                })
            }
        }
    };
}

canonical_record! {
    /// Canonical contract scalars.
    pub struct ContractFields {
        text {
            contract_number => ["contractNumber", "合同编号"],
            party_a_name => ["partyAName", "甲方", "甲方名称"],
            party_a_company_name => ["partyACompanyName", "甲方单位名称"],
            party_a_address => ["partyAAddress", "甲方地址", "甲方单位地址"],
            party_a_contact => ["partyAContact", "甲方联系人"],
            party_a_phone_fax => ["partyAPhoneFax", "甲方电话传真"],
            party_a_bank => ["partyABank", "甲方开户银行"],
            party_a_bank_account => ["partyABankAccount", "甲方账号", "甲方帐号"],
            party_a_bank_no => ["partyABankNo", "甲方行号"],
            party_a_tax_number => ["partyATaxNumber", "甲方税号"],
            party_b_name => ["partyBName", "乙方", "乙方名称"],
            party_b_company_name => ["partyBCompanyName", "乙方单位名称"],
            party_b_address => ["partyBAddress", "乙方地址", "乙方单位地址"],
            party_b_contact => ["partyBContact", "乙方联系人"],
            party_b_phone_fax => ["partyBPhoneFax", "乙方电话传真"],
            party_b_bank => ["partyBBank", "乙方开户银行"],
            party_b_bank_account => ["partyBBankAccount", "乙方账号", "乙方帐号"],
            party_b_bank_no => ["partyBBankNo", "乙方行号"],
            party_b_tax_number => ["partyBTaxNumber", "乙方税号"],
            signed_date => ["signedDate", "签订日期"],
            signed_location => ["signedLocation", "签订地点"],
            status => ["status", "合同状态"],
            contract_attribute => ["contractAttribute", "合同属性"],
            delivery_deadline => ["deliveryDeadline", "交货期限"],
            actual_delivery_date => ["actualDeliveryDate", "实际交货日期"],
            settlement_date => ["settlementDate", "结清日期"],
            payment_status => ["paymentStatus", "是否回款"],
            payment_date => ["paymentDate", "回款时间"],
            shipping_date => ["shippingDate", "出库日期"],
            sales_id => ["salesId", "销售ID", "销售编号"],
            ink_capacity => ["inkCapacity", "载墨量"],
            cell_shape => ["cellShape", "网穴形状"],
            remark => ["remark", "备注"],
        }
        flags {
            is_new_artwork => ["isNewArtwork", "是否新图"],
            is_reviewed => ["isReviewed", "是否审核"],
            is_scheduled => ["isScheduled", "是否排产"],
        }
    }
}

canonical_record! {
    /// Canonical line-item descriptors. Quantities and prices stay text so
    /// the submitted formatting survives.
    pub struct ProductFields {
        text {
            product_id => ["productId", "产品ID"],
            product_code => ["productCode", "产品编号"],
            product_name => ["productName", "产品名称"],
            specification => ["specification", "规格"],
            carve_width => ["carveWidth", "雕宽"],
            mesh_type => ["meshType", "网型"],
            line_count => ["lineCount", "线数"],
            volume_ratio => ["volumeRatio", "容积率"],
            ink_volume => ["inkVolume", "载墨量"],
            quantity => ["quantity", "数量"],
            unit_price => ["unitPrice", "单价"],
            plate_unit_price => ["plateUnitPrice", "平厘单价"],
            total_amount => ["totalAmount", "总金额"],
            product_type_id => ["productTypeId", "产品类型ID"],
            product_type_name => ["productTypeName", "产品类型", "类型名称"],
            product_type_code => ["productTypeCode", "产品类型编码", "类型编码"],
            cell_shape => ["cellShape", "网穴形状"],
        }
        flags {
            new_wood_box => ["newWoodBox", "新木箱"],
        }
    }
}

/// Ordinal clause slots, probed in order when no explicit `terms` array is sent.
pub const TERM_CLAUSES: [[&str; 2]; 10] = [
    ["条款一", "条款1"],
    ["条款二", "条款2"],
    ["条款三", "条款3"],
    ["条款四", "条款4"],
    ["条款五", "条款5"],
    ["条款六", "条款6"],
    ["条款七", "条款7"],
    ["条款八", "条款8"],
    ["条款九", "条款9"],
    ["条款十", "条款10"],
];

/// Named production checkpoints carried in the process-status bag.
pub const PROCESS_CHECKPOINTS: &[FieldAliases] = &[
    FieldAliases { name: "startProduction", aliases: &["开始生产", "startProduction"] },
    FieldAliases { name: "baseRollProcessing", aliases: &["基辊加工", "baseRollProcessing"] },
    FieldAliases { name: "thermalSpraying", aliases: &["热喷涂", "thermalSpraying"] },
    FieldAliases { name: "ceramicGrinding", aliases: &["陶瓷磨削", "ceramicGrinding"] },
    FieldAliases { name: "prePolishing", aliases: &["前续抛光", "prePolishing"] },
    FieldAliases { name: "laserEngraving", aliases: &["激光雕刻", "laserEngraving"] },
    FieldAliases { name: "postPolishing", aliases: &["后续抛光", "postPolishing"] },
    FieldAliases { name: "inspection", aliases: &["检验尺寸", "inspection"] },
    FieldAliases { name: "packaging", aliases: &["包装出库", "packaging"] },
];

/// Keys that may hold the line-item list, in priority order.
pub const PRODUCT_LIST_KEYS: &[&str] = &["products", "productList", "产品列表"];

/// Explicit bag keys accepted at the contract level.
pub const BAG_KEYS: &[&str] = &["terms", "termsJson", "processStatus", "processStatusJson"];

/// Keys the read path emits; recognised so a fetched contract can be sent
/// back through PUT without polluting the extra-info bag.
pub const CONTRACT_ECHO_KEYS: &[&str] = &[
    "id",
    "extraInfo",
    "rawData",
    "salesEmployeeId",
    "createdAt",
    "updatedAt",
];
pub const PRODUCT_ECHO_KEYS: &[&str] = &[
    "id",
    "extraInfo",
    "productIndex",
    "contractId",
    "createdAt",
    "updatedAt",
];

/// Every top-level key the contract normalizer understands.
pub static KNOWN_CONTRACT_KEYS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ContractFields::ALIASES
        .iter()
        .chain(PROCESS_CHECKPOINTS)
        .flat_map(|f| f.aliases.iter().copied())
        .chain(TERM_CLAUSES.iter().flatten().copied())
        .chain(PRODUCT_LIST_KEYS.iter().copied())
        .chain(BAG_KEYS.iter().copied())
        .chain(CONTRACT_ECHO_KEYS.iter().copied())
        .collect()
});

/// Every line-item key the product normalizer understands.
pub static KNOWN_PRODUCT_KEYS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ProductFields::ALIASES
        .iter()
        .flat_map(|f| f.aliases.iter().copied())
        .chain(PRODUCT_ECHO_KEYS.iter().copied())
        .collect()
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn first_alias_in_declared_order_wins() {
        let payload = obj(json!({"甲方": "Localized", "partyAName": "Latin"}));
        let fields = ContractFields::resolve(&payload);
        assert_eq!(fields.party_a_name.as_deref(), Some("Latin"));

        let payload = obj(json!({"甲方名称": "Third", "甲方": "Second"}));
        let fields = ContractFields::resolve(&payload);
        assert_eq!(fields.party_a_name.as_deref(), Some("Second"));
    }

    #[test]
    fn blank_strings_fall_through_to_next_alias() {
        let payload = obj(json!({"partyAName": "   ", "甲方": "Acme"}));
        assert_eq!(
            ContractFields::resolve(&payload).party_a_name.as_deref(),
            Some("Acme")
        );
        let payload = obj(json!({"partyAName": null, "甲方": "Acme"}));
        assert_eq!(
            ContractFields::resolve(&payload).party_a_name.as_deref(),
            Some("Acme")
        );
    }

    #[test]
    fn non_string_values_are_accepted() {
        let payload = obj(json!({"数量": 10, "产品名称": "Widget"}));
        let fields = ProductFields::resolve(&payload);
        assert_eq!(fields.quantity.as_deref(), Some("10"));
        assert_eq!(fields.product_name.as_deref(), Some("Widget"));
    }

    #[test]
    fn flags_use_boolean_vocabulary() {
        let payload = obj(json!({"是否新图": "是", "isReviewed": "maybe", "是否排产": "0"}));
        let fields = ContractFields::resolve(&payload);
        assert_eq!(fields.is_new_artwork, Some(true));
        assert_eq!(fields.is_reviewed, None);
        assert_eq!(fields.is_scheduled, Some(false));
    }

    #[test]
    fn assigned_skips_absent_fields() {
        let payload = obj(json!({"contractNumber": "C-1", "isScheduled": "否"}));
        let assigned = ContractFields::resolve(&payload).assigned();
        let columns: Vec<_> = assigned.iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, vec!["contract_number", "is_scheduled"]);
        assert_eq!(assigned[1].1, SqlValue::Integer(0));
    }

    #[test]
    fn serializes_with_camel_case_names() {
        let fields = ContractFields {
            party_a_name: Some("Acme".into()),
            is_new_artwork: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json, json!({"partyAName": "Acme", "isNewArtwork": true}));
    }

    #[test]
    fn latin_alias_matches_serialized_name() {
        // The first alias of each record field is the name the read path emits.
        let fields = ContractFields::resolve(&obj(json!({})));
        assert_eq!(fields, ContractFields::default());
        for entry in ContractFields::ALIASES {
            let payload = obj(json!({ entry.aliases[0]: "1" }));
            let json = serde_json::to_value(ContractFields::resolve(&payload)).unwrap();
            assert!(
                json.get(entry.aliases[0]).is_some(),
                "{} does not round-trip",
                entry.name
            );
        }
    }

    #[test]
    fn allowlists_cover_every_alias() {
        for entry in ContractFields::ALIASES.iter().chain(PROCESS_CHECKPOINTS) {
            for alias in entry.aliases {
                assert!(KNOWN_CONTRACT_KEYS.contains(alias), "{alias}");
            }
        }
        for entry in ProductFields::ALIASES {
            for alias in entry.aliases {
                assert!(KNOWN_PRODUCT_KEYS.contains(alias), "{alias}");
            }
        }
        assert!(KNOWN_CONTRACT_KEYS.contains("产品列表"));
        assert!(KNOWN_CONTRACT_KEYS.contains("条款10"));
        assert!(KNOWN_PRODUCT_KEYS.contains("id"));
        assert!(!KNOWN_CONTRACT_KEYS.contains("customField"));
    }
}
