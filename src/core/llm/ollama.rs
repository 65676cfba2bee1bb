use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::GatewayError;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Blocking client for a local Ollama endpoint.
pub struct OllamaClient {
    base_url: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl OllamaClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client construction cannot fail with static options")
        })
    }

    /// True when the endpoint answers /api/tags within 2 seconds.
    pub fn healthy(&self) -> bool {
        self.client()
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Installed model names, for the health report.
    pub fn list_models(&self) -> Vec<String> {
        let Ok(response) = self
            .client()
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
        else {
            return Vec::new();
        };
        response
            .json::<TagsResponse>()
            .map(|t| t.models.into_iter().map(|m| m.name).collect())
            .unwrap_or_default()
    }

    /// One /api/generate round-trip. The system prompt is folded into the
    /// prompt text, as Ollama's generate endpoint has no separate field.
    pub fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<String, GatewayError> {
        let full_prompt = if system.is_empty() {
            prompt.to_string()
        } else {
            format!("{system}\n\n{prompt}")
        };

        debug!("Ollama call: model={model}, {} chars", full_prompt.len());

        let response = self
            .client()
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model,
                prompt: &full_prompt,
                stream: false,
            })
            .send()
            .map_err(|e| GatewayError::Api(format!("ollama: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Api(format!(
                "ollama: status {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| GatewayError::Api(format!("ollama decode: {e}")))?;

        if parsed.response.trim().is_empty() {
            return Err(GatewayError::Empty);
        }
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_is_non_streaming() {
        let req = GenerateRequest {
            model: "llama3.1:8b",
            prompt: "hello",
            stream: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["model"], "llama3.1:8b");
    }

    #[test]
    fn tags_response_decodes_model_names() {
        let raw = r#"{"models": [{"name": "llama3.1:8b"}, {"name": "qwen2:7b"}]}"#;
        let parsed: TagsResponse = serde_json::from_str(raw).unwrap();
        let names: Vec<String> = parsed.models.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["llama3.1:8b", "qwen2:7b"]);
    }

    #[test]
    fn empty_generate_response_decodes_to_empty_string() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.response.is_empty());
    }
}
