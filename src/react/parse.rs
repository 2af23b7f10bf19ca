//! Lenient parsing of oracle output
//!
//! Model responses are supposed to be JSON but rarely are, exactly. Try in
//! order: the raw text, a fenced code block, the first balanced `{...}`
//! substring. Anything else parses as the empty object, which callers treat
//! as a failed phase.

use serde_json::{Map, Value};

/// Parse a model response into a JSON object, as leniently as possible.
pub fn parse_json_response(text: &str) -> Value {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return value;
        }
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if value.is_object() {
                return value;
            }
        }
    }

    if let Some(candidate) = extract_balanced_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return value;
            }
        }
    }

    Value::Object(Map::new())
}

/// Whether a parsed response is the empty-object failure marker.
pub fn is_empty_response(value: &Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(true)
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        let value = parse_json_response(r#"{"analysis": "fine", "options": ["a"]}"#);
        assert_eq!(value["analysis"], "fine");
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here is my answer:\n```json\n{\"score\": 0.9}\n```\nDone.";
        let value = parse_json_response(text);
        assert_eq!(value["score"], json!(0.9));
    }

    #[test]
    fn test_fence_without_language_tag() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(parse_json_response(text)["a"], json!(1));
    }

    #[test]
    fn test_embedded_object() {
        let text = "I think the answer is {\"verdict\": {\"nested\": true}} based on the data.";
        let value = parse_json_response(text);
        assert_eq!(value["verdict"]["nested"], json!(true));
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"prefix {"note": "has } brace", "ok": true} suffix"#;
        let value = parse_json_response(text);
        assert_eq!(value["ok"], json!(true));
    }

    #[test]
    fn test_garbage_yields_empty() {
        let value = parse_json_response("no json here at all");
        assert!(is_empty_response(&value));

        let value = parse_json_response("[1, 2, 3]");
        assert!(is_empty_response(&value));
    }
}
