// Token estimation for engines that omit `usage`
//
// ~4 chars per token for English text. Only fills prompt counts; completion
// tokens stay at whatever the engine reported.

use serde_json::Value;

pub fn rough_token_count(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Sum the estimate over chat message contents. Content may be a plain
/// string or a list of `{"text": ...}` parts.
pub fn estimate_chat_prompt_tokens(messages: &[Value]) -> u64 {
    let mut total = 0;
    for message in messages {
        match message.get("content") {
            Some(Value::String(text)) => total += rough_token_count(text),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part
                        .get("text")
                        .or_else(|| part.get("content"))
                        .and_then(Value::as_str)
                    {
                        total += rough_token_count(text);
                    }
                }
            }
            _ => {}
        }
    }
    total
}

/// Estimate over a completions `prompt` field (string or list of strings)
pub fn estimate_prompt_tokens(prompt: &Value) -> u64 {
    match prompt {
        Value::String(text) => rough_token_count(text),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(rough_token_count)
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(rough_token_count(""), 0);
        assert_eq!(rough_token_count("abcd"), 1);
        assert_eq!(rough_token_count("abcdefg"), 1);
        assert_eq!(rough_token_count("a".repeat(400).as_str()), 100);
    }

    #[test]
    fn chat_estimate_handles_string_and_part_contents() {
        let messages = vec![
            json!({"role": "system", "content": "You are terse."}),
            json!({"role": "user", "content": [{"type": "text", "text": "Hello there, assistant"}]}),
            json!({"role": "assistant"}),
        ];
        let expected = rough_token_count("You are terse.") + rough_token_count("Hello there, assistant");
        assert_eq!(estimate_chat_prompt_tokens(&messages), expected);
    }

    #[test]
    fn prompt_estimate_handles_lists() {
        assert_eq!(estimate_prompt_tokens(&json!("12345678")), 2);
        assert_eq!(estimate_prompt_tokens(&json!(["abcd", "efgh"])), 2);
        assert_eq!(estimate_prompt_tokens(&json!(null)), 0);
    }
}
