//! Scalar coercions applied to raw payload values.

use serde_json::Value;

const TRUE_TOKENS: &[&str] = &[
    "1", "true", "yes", "y", "t", "是", "有", "已", "已完成", "已回款",
];
const FALSE_TOKENS: &[&str] = &[
    "0", "false", "no", "n", "f", "否", "无", "未", "未完成", "未回款",
];

/// Render a payload value as trimmed text. `None` for null and blank values.
///
/// Numbers and booleans keep their JSON spelling; nested arrays and objects
/// are stored as compact JSON.
pub fn normalize_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    if text.is_empty() { None } else { Some(text) }
}

/// Map a payload value onto a boolean using the bilingual token vocabulary.
///
/// Returns `None` for anything outside the vocabulary: callers must omit the
/// field rather than store `false`.
pub fn normalize_boolean(value: &Value) -> Option<bool> {
    if let Value::Bool(b) = value {
        return Some(*b);
    }
    let text = normalize_text(value)?;
    let lower = text.to_lowercase();
    if TRUE_TOKENS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_TOKENS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parse an integer key out of a text or numeric value.
pub fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
