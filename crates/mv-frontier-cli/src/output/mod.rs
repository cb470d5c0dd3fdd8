pub mod csv_out;
pub mod json;
pub mod minimal;
pub mod table;

use crate::OutputFormat;
use serde_json::Value;

/// Render in the requested format and write to stdout.
pub fn format_output(format: &OutputFormat, value: &Value) {
    let rendered = match format {
        OutputFormat::Json => json::render_json(value),
        OutputFormat::Table => Ok(table::render_table(value)),
        OutputFormat::Csv => csv_out::render_csv(value),
        OutputFormat::Minimal => Ok(minimal::render_minimal(value)),
    };
    match rendered {
        Ok(text) => print!("{}", text),
        Err(e) => eprintln!("Output error: {}", e),
    }
}

/// Numbers rounded to six decimals for human-facing formats.
pub(crate) fn format_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(x) if n.is_f64() => trim_float(x),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn trim_float(x: f64) -> String {
    let s = format!("{:.6}", x);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}
