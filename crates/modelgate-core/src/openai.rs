// OpenAI-compatible wire types and the chat-template fallback transforms
//
// The gateway forwards request bodies untouched, so the typed structs only
// name the fields the router itself reads; everything else is carried in
// `extra` and serialized back out verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token counts reported by an upstream engine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageCounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl UsageCounts {
    pub fn from_response(body: &Value) -> Self {
        let usage = body.get("usage");
        let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_u64);
        Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        }
    }
}

/// Whether an upstream 4xx body is the "chat template required" rejection
/// some engines return for models shipped without a template.
pub fn is_chat_template_error(body: &Value) -> bool {
    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        })
        .unwrap_or_default();
    message.to_lowercase().contains("chat template")
}

/// Join chat messages into a plain prompt for models without a template.
/// Shape: "System: ...\n\nUser: ...\n\nAssistant:"
pub fn messages_to_prompt(messages: &[Value]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for message in messages {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let text = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(segments)) => segments
                .iter()
                .filter_map(|seg| seg.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        };
        let label = match role.as_str() {
            "system" => "System",
            "user" => "User",
            _ => "Assistant",
        };
        if !text.is_empty() {
            parts.push(format!("{label}: {text}"));
        }
    }
    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}

/// Build the /v1/completions payload the fallback reissues
pub fn fallback_completion_payload(chat_payload: &Value, prompt: String) -> Value {
    json!({
        "model": chat_payload.get("model").cloned().unwrap_or(Value::Null),
        "prompt": prompt,
        "max_tokens": chat_payload.get("max_tokens").and_then(Value::as_u64).unwrap_or(128),
        "temperature": chat_payload.get("temperature").and_then(Value::as_f64).unwrap_or(0.7),
        "stream": false,
    })
}

/// Wrap a completions response into the chat schema clients asked for
pub fn normalize_completion_to_chat(completion: &Value, requested_model: &str) -> Value {
    let choices: Vec<Value> = completion
        .get("choices")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|choice| {
                    json!({
                        "index": choice.get("index").and_then(Value::as_u64).unwrap_or(0),
                        "message": {
                            "role": "assistant",
                            "content": choice.get("text").and_then(Value::as_str).unwrap_or(""),
                        },
                        "finish_reason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": completion.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "created": completion.get("created").cloned().unwrap_or(Value::Null),
        "model": completion
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model),
        "choices": choices,
        "usage": completion.get("usage").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_fields_survive_a_round_trip() {
        let raw = json!({
            "model": "m1",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "max_tokens": 256,
            "top_k": 40,
            "repetition_penalty": 1.1
        });
        let req: ChatCompletionRequest = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(req.model, "m1");
        assert!(req.stream);
        assert_eq!(req.max_tokens, Some(256));
        assert_eq!(req.extra.get("top_k"), Some(&json!(40)));

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back.get("repetition_penalty"), raw.get("repetition_penalty"));
    }

    #[test]
    fn chat_template_rejection_is_detected_case_insensitively() {
        assert!(is_chat_template_error(&json!({
            "message": "As of transformers v4.44, the chat template is required"
        })));
        assert!(is_chat_template_error(&json!({
            "error": {"message": "No Chat Template defined for this model"}
        })));
        assert!(!is_chat_template_error(&json!({"message": "model not found"})));
        assert!(!is_chat_template_error(&json!({})));
    }

    #[test]
    fn prompt_joins_roles_with_labels() {
        let messages = vec![
            json!({"role": "system", "content": "Be brief."}),
            json!({"role": "user", "content": "What is Rust?"}),
            json!({"role": "assistant", "content": "A language."}),
            json!({"role": "user", "content": [{"type": "text", "text": "More detail"}]}),
        ];
        let prompt = messages_to_prompt(&messages);
        assert_eq!(
            prompt,
            "System: Be brief.\n\nUser: What is Rust?\n\nAssistant: A language.\n\nUser: More detail\n\nAssistant:"
        );
    }

    #[test]
    fn empty_messages_still_yield_the_assistant_cue() {
        assert_eq!(messages_to_prompt(&[]), "Assistant:");
    }

    #[test]
    fn normalized_completion_takes_chat_shape() {
        let completion = json!({
            "id": "cmpl-1",
            "created": 1700000000,
            "model": "m1",
            "choices": [{"index": 0, "text": "hello", "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}
        });
        let chat = normalize_completion_to_chat(&completion, "m1");
        assert_eq!(chat["object"], "chat.completion");
        assert_eq!(chat["choices"][0]["message"]["role"], "assistant");
        assert_eq!(chat["choices"][0]["message"]["content"], "hello");
        assert_eq!(chat["usage"]["total_tokens"], 5);
    }

    #[test]
    fn usage_counts_tolerate_missing_fields() {
        let counts = UsageCounts::from_response(&json!({"usage": {"prompt_tokens": 7}}));
        assert_eq!(counts.prompt_tokens, Some(7));
        assert_eq!(counts.completion_tokens, None);

        let absent = UsageCounts::from_response(&json!({}));
        assert_eq!(absent.prompt_tokens, None);
    }
}
