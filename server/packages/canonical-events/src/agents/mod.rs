pub mod anthropic;
pub mod claude;

use serde_json::Value;

/// Collapses a native tool-result payload to plain text.
///
/// Strings pass through, arrays of `{type: "text"}` blocks are joined with
/// newlines, and anything else is rendered as compact JSON.
pub fn flatten_text_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_block_arrays() {
        let content = json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(flatten_text_content(&content), "a\nb");
        assert_eq!(flatten_text_content(&json!("plain")), "plain");
        assert_eq!(flatten_text_content(&json!({"k": 1})), "{\"k\":1}");
    }
}
