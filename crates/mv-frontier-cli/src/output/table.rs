use serde_json::{Map, Value};
use tabled::{builder::Builder, Table};

use super::format_scalar;

/// Render as tables: scalar result fields first, then one table per nested
/// portfolio or row list, then warnings and methodology.
pub fn render_table(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => match map.get("result") {
            Some(result) => render_result(&mut out, result, map),
            None => out.push_str(&field_table(map)),
        },
        Value::Array(rows) => out.push_str(&rows_table(rows)),
        other => out.push_str(&format_scalar(other)),
    }
    out.push('\n');
    out
}

fn render_result(out: &mut String, result: &Value, envelope: &Map<String, Value>) {
    match result {
        Value::Object(fields) => {
            out.push_str(&field_table(fields));
            for (key, val) in fields {
                match val {
                    Value::Object(nested) => {
                        out.push_str(&format!("\n\n{}:\n", heading(key)));
                        out.push_str(&field_table(nested));
                    }
                    Value::Array(rows) if rows.iter().any(Value::is_object) => {
                        out.push_str(&format!("\n\n{}:\n", heading(key)));
                        out.push_str(&rows_table(rows));
                    }
                    _ => {}
                }
            }
        }
        Value::Null => out.push_str("No solution"),
        other => out.push_str(&format_scalar(other)),
    }

    if let Some(Value::Array(warnings)) = envelope.get("warnings") {
        if !warnings.is_empty() {
            out.push_str("\n\nWarnings:");
            for w in warnings.iter().filter_map(Value::as_str) {
                out.push_str(&format!("\n  - {}", w));
            }
        }
    }

    if let Some(Value::String(meth)) = envelope.get("methodology") {
        out.push_str(&format!("\n\nMethodology: {}", meth));
    }
}

/// Two-column table of the scalar (and scalar-array) fields.
fn field_table(map: &Map<String, Value>) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    for (key, val) in map {
        let cell = match val {
            Value::Object(_) => continue,
            Value::Array(items) if items.iter().any(Value::is_object) => continue,
            Value::Array(items) => items.iter().map(format_scalar).collect::<Vec<_>>().join(", "),
            other => format_scalar(other),
        };
        builder.push_record([key.clone(), cell]);
    }
    Table::from(builder).to_string()
}

/// One row per object, columns from the first object's keys.
fn rows_table(rows: &[Value]) -> String {
    let Some(Value::Object(first)) = rows.first() else {
        return rows.iter().map(format_scalar).collect::<Vec<_>>().join("\n");
    };

    let headers: Vec<String> = first.keys().cloned().collect();
    let mut builder = Builder::default();
    builder.push_record(headers.clone());
    for row in rows.iter().filter_map(Value::as_object) {
        let cells: Vec<String> = headers
            .iter()
            .map(|h| match row.get(h.as_str()) {
                Some(Value::Array(items)) => {
                    items.iter().map(format_scalar).collect::<Vec<_>>().join(", ")
                }
                Some(v) => format_scalar(v),
                None => String::new(),
            })
            .collect();
        builder.push_record(cells);
    }
    Table::from(builder).to_string()
}

fn heading(key: &str) -> String {
    let mut words: Vec<String> = key
        .split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    words.retain(|w| !w.is_empty());
    words.join(" ")
}
