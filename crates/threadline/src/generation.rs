//! Text generation for `/chat` via an OpenAI-style Responses endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{openai_api_key, GenerationConfig};
use crate::embedding::{parse_retry_hint, ProviderError};

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub struct OpenAIGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Prefer the flat `output_text`, else join every `output_text` part.
fn extract_text(body: ResponsesBody) -> Option<String> {
    if let Some(text) = body.output_text.filter(|t| !t.is_empty()) {
        return Some(text);
    }
    let parts: Vec<String> = body
        .output
        .into_iter()
        .flat_map(|item| item.content)
        .filter(|part| part.kind == "output_text")
        .filter_map(|part| part.text)
        .collect();
    (!parts.is_empty()).then(|| parts.join(""))
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": prompt,
        });
        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_hint(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                retry_after,
                message,
            });
        }

        let parsed: ResponsesBody = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        extract_text(parsed)
            .ok_or_else(|| ProviderError::InvalidResponse("response contained no text".into()))
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>> {
    Ok(Arc::new(OpenAIGenerator::new(config, openai_api_key()?)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator(server: &MockServer) -> OpenAIGenerator {
        let config = GenerationConfig {
            base_url: server.uri(),
            model: "test-gen".into(),
            ..Default::default()
        };
        OpenAIGenerator::new(&config, "sk-test".into()).unwrap()
    }

    #[tokio::test]
    async fn test_flat_output_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(body_partial_json(serde_json::json!({"model": "test-gen"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"output_text": "answer [1]"})),
            )
            .mount(&server)
            .await;

        let text = generator(&server).generate("q").await.unwrap();
        assert_eq!(text, "answer [1]");
    }

    #[tokio::test]
    async fn test_nested_output_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": [
                    {"type": "reasoning", "content": []},
                    {"type": "message", "content": [
                        {"type": "output_text", "text": "part one, "},
                        {"type": "refusal", "text": "ignored"},
                        {"type": "output_text", "text": "part two"}
                    ]}
                ]
            })))
            .mount(&server)
            .await;

        let text = generator(&server).generate("q").await.unwrap();
        assert_eq!(text, "part one, part two");
    }

    #[tokio::test]
    async fn test_empty_response_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = generator(&server).generate("q").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_http_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = generator(&server).generate("q").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 503, .. }));
    }
}
