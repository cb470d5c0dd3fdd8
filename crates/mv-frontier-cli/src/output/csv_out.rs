use serde_json::{Map, Value};

/// CSV text. Arrays become one record per row; a result object becomes
/// `field,value` pairs with nested objects flattened to dotted keys.
pub fn render_csv(value: &Value) -> Result<String, Box<dyn std::error::Error>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());

    match value {
        Value::Array(rows) => write_rows(&mut wtr, rows)?,
        Value::Object(map) => {
            let target = match map.get("result") {
                Some(Value::Object(result)) => result,
                _ => map,
            };
            wtr.write_record(["field", "value"])?;
            let mut pairs = Vec::new();
            flatten("", target, &mut pairs);
            for (key, val) in pairs {
                wtr.write_record([key, val])?;
            }
        }
        other => wtr.write_record([format_csv_value(other)])?,
    }

    Ok(String::from_utf8(wtr.into_inner()?)?)
}

fn write_rows(wtr: &mut csv::Writer<Vec<u8>>, rows: &[Value]) -> csv::Result<()> {
    let Some(Value::Object(first)) = rows.first() else {
        for item in rows {
            wtr.write_record([format_csv_value(item)])?;
        }
        return Ok(());
    };

    let headers: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
    wtr.write_record(&headers)?;
    for row in rows.iter().filter_map(Value::as_object) {
        let record: Vec<String> = headers
            .iter()
            .map(|h| row.get(*h).map(format_csv_value).unwrap_or_default())
            .collect();
        wtr.write_record(&record)?;
    }
    Ok(())
}

fn flatten(prefix: &str, map: &Map<String, Value>, out: &mut Vec<(String, String)>) {
    for (key, val) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match val {
            Value::Object(nested) => flatten(&name, nested, out),
            other => out.push((name, format_csv_value(other))),
        }
    }
}

/// Full precision: CSV output is meant for further processing.
fn format_csv_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
