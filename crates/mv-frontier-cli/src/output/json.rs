use serde_json::Value;

/// Pretty-printed JSON with a trailing newline.
pub fn render_json(value: &Value) -> Result<String, Box<dyn std::error::Error>> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}
