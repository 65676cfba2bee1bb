use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::GatewayError;

/// Floor for max_tokens when extended thinking is enabled. The budget is
/// shared between thinking and text; too low a value lets the model spend
/// it all on thinking and return zero text blocks.
const THINKING_MIN_TOKENS: u32 = 128_000;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingParam>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ThinkingParam {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseContentBlock>,
    usage: Option<Usage>,
}

/// Response content blocks. Thinking blocks are decoded so they can be
/// skipped explicitly; anything unrecognised is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        #[allow(dead_code)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    thinking_tokens: Option<u64>,
}

/// One successful remote completion.
#[derive(Debug)]
pub struct RemoteCompletion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

/// Blocking client for the Anthropic Messages API.
///
/// Blocking on purpose: every call site runs inside a pipeline worker
/// thread, never on the async runtime (the gateway's event-loop guard
/// enforces this).
pub struct AnthropicClient {
    api_key: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .expect("reqwest client construction cannot fail with static options")
        })
    }

    /// One Messages API round-trip. Transient failures map to the retryable
    /// `GatewayError` kinds; the gateway owns the retry loop.
    pub fn complete(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        max_tokens: u32,
        temperature: f32,
        thinking: bool,
    ) -> Result<RemoteCompletion, GatewayError> {
        let request = MessagesRequest {
            model,
            max_tokens: if thinking {
                max_tokens.max(THINKING_MIN_TOKENS)
            } else {
                max_tokens
            },
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            // Temperature must not be set alongside thinking.
            temperature: if thinking { None } else { Some(temperature) },
            thinking: thinking.then_some(ThinkingParam { kind: "adaptive" }),
        };

        debug!("Anthropic call: model={model}, thinking={thinking}");

        let response = self
            .client()
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }
        if status.is_server_error() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::Api(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::Fatal(format!("API error {status}: {body}")));
        }

        let parsed: MessagesResponse = response
            .json()
            .map_err(|e| GatewayError::Api(format!("response decode: {e}")))?;

        let (input_tokens, output_tokens, thinking_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens, u.thinking_tokens.unwrap_or(0)))
            .unwrap_or((0, 0, 0));

        info!(
            "Anthropic call: model={model} input={input_tokens} output={output_tokens}{}",
            if thinking_tokens > 0 {
                format!(" thinking={thinking_tokens}")
            } else {
                String::new()
            }
        );

        // Thinking responses interleave thinking and text blocks; only the
        // text blocks are the answer. A response with no text block at all
        // is the retryable "thinking-only" case.
        let text_parts: Vec<&str> = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        if text_parts.is_empty() {
            return Err(GatewayError::Empty);
        }

        Ok(RemoteCompletion {
            text: text_parts.join("\n"),
            input_tokens,
            output_tokens,
            thinking_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_thinking_omits_temperature_and_floors_tokens() {
        let request = MessagesRequest {
            model: "claude-sonnet-4-6",
            max_tokens: 4096_u32.max(THINKING_MIN_TOKENS),
            system: "sys",
            messages: vec![Message {
                role: "user",
                content: "hi",
            }],
            temperature: None,
            thinking: Some(ThinkingParam { kind: "adaptive" }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["thinking"]["type"], "adaptive");
        assert_eq!(json["max_tokens"], 128_000);
    }

    #[test]
    fn request_without_system_omits_the_field() {
        let request = MessagesRequest {
            model: "m",
            max_tokens: 100,
            system: "",
            messages: vec![],
            temperature: Some(0.0),
            thinking: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("system").is_none());
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn thinking_only_response_has_no_text_blocks() {
        let raw = r#"{
            "content": [{"type": "thinking", "thinking": "hmm"}],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let texts: Vec<&str> = parsed
            .content
            .iter()
            .filter_map(|b| match b {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(texts.is_empty());
    }

    #[test]
    fn mixed_response_extracts_only_text() {
        let raw = r#"{
            "content": [
                {"type": "thinking", "thinking": "let me think"},
                {"type": "text", "text": "answer one"},
                {"type": "text", "text": "answer two"}
            ],
            "usage": {"input_tokens": 1, "output_tokens": 2, "thinking_tokens": 3}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let texts: Vec<&str> = parsed
            .content
            .iter()
            .filter_map(|b| match b {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.join("\n"), "answer one\nanswer two");
        assert_eq!(parsed.usage.unwrap().thinking_tokens, Some(3));
    }

    #[test]
    fn unknown_block_types_are_tolerated() {
        let raw = r#"{"content": [{"type": "tool_use", "id": "x"}, {"type": "text", "text": "ok"}]}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 2);
    }
}
