use serde_json::Value;

use super::format_scalar;

/// Just the key answer: the weights of a portfolio query, one
/// `name=weight` pair per asset, or one line per row for arrays.
///
/// Falls back through a priority list of result fields, then the first
/// field of the result object.
pub fn render_minimal(value: &Value) -> String {
    let result_obj = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    let priority_keys = [
        "weights",
        "tangency_portfolio",
        "min_variance_portfolio",
        "expected_return",
        "volatility",
    ];

    match result_obj {
        Value::Null => "none\n".to_string(),
        Value::Array(rows) => rows.iter().map(|r| format!("{}\n", inline(r))).collect(),
        Value::Object(map) => {
            for key in &priority_keys {
                if let Some(val) = map.get(*key) {
                    if !val.is_null() {
                        return format!("{}\n", inline(val));
                    }
                }
            }
            match map.iter().next() {
                Some((key, val)) => format!("{}: {}\n", key, inline(val)),
                None => "\n".to_string(),
            }
        }
        other => format!("{}\n", format_scalar(other)),
    }
}

/// One line: objects as space-separated `key=value`, a nested portfolio
/// through its weights.
fn inline(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            if let Some(weights) = map.get("weights") {
                return inline(weights);
            }
            map.iter()
                .map(|(k, v)| format!("{}={}", k, format_scalar(v)))
                .collect::<Vec<_>>()
                .join(" ")
        }
        Value::Array(items) => items.iter().map(inline).collect::<Vec<_>>().join(" "),
        other => format_scalar(other),
    }
}
