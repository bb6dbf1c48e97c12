use crate::config::{LlmProvider, LlmSettings};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// A chat model that turns a system + user prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Send a trivial prompt to confirm credentials and endpoint.
    async fn test_connection(&self) -> Result<()> {
        let reply = self
            .complete("You are a connectivity check.", "Reply with the single word OK.")
            .await?;
        debug!("LLM connectivity reply: {}", reply);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    message: String,
}

pub struct LlmClient {
    api_key: String,
    provider: LlmProvider,
    client: Client,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Llm(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key: settings.api_key,
            provider: settings.provider,
            client,
            temperature: 0.1,
            max_tokens: 2000,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Human-readable model identifier for logs and run records.
    pub fn model_name(&self) -> &str {
        match &self.provider {
            LlmProvider::AzureOpenAi { deployment, .. } => deployment,
            LlmProvider::OpenAi { model, .. } => model,
        }
    }

    fn request(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        match &self.provider {
            LlmProvider::AzureOpenAi {
                endpoint,
                deployment,
                api_version,
            } => {
                let url = format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint, deployment, api_version
                );
                self.client
                    .post(url)
                    .header("api-key", &self.api_key)
                    .json(&body)
            }
            LlmProvider::OpenAi { base_url, model } => {
                let mut body = body;
                body["model"] = serde_json::Value::String(model.clone());
                self.client
                    .post(format!("{}/chat/completions", base_url))
                    .bearer_auth(&self.api_key)
                    .json(&body)
            }
        }
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::Llm(format!("Failed to read response: {}", e)))?;

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                PipelineError::Llm(format!("Failed to parse response: {}", e))
            } else {
                PipelineError::Llm(format!("HTTP {}: {}", status.as_u16(), truncate(&text, 500)))
            }
        })?;

        if let Some(err) = parsed.error {
            return Err(PipelineError::Llm(format!("HTTP {}: {}", status.as_u16(), err.message)));
        }
        if !status.is_success() {
            return Err(PipelineError::Llm(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&text, 500)
            )));
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM returned {} chars", content.len());
        Ok(content.trim().to_string())
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_model_name() {
        let client = LlmClient::new(LlmSettings {
            api_key: "k".to_string(),
            provider: LlmProvider::AzureOpenAi {
                endpoint: "https://x".to_string(),
                deployment: "gpt-4o".to_string(),
                api_version: "v".to_string(),
            },
        })
        .unwrap();
        assert_eq!(client.model_name(), "gpt-4o");
    }

    #[tokio::test]
    async fn test_sampling_settings_and_connection_check() {
        use wiremock::matchers::{body_partial_json, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4",
                "temperature": 0.5,
                "max_tokens": 256
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": " OK \n"}}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = LlmClient::new(LlmSettings {
            api_key: "sk-test".to_string(),
            provider: LlmProvider::OpenAi {
                base_url: server.uri(),
                model: "gpt-4".to_string(),
            },
        })
        .unwrap()
        .with_temperature(0.5)
        .with_max_tokens(256);

        assert_eq!(client.complete("system", "user").await.unwrap(), "OK");
        client.test_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_check_reports_failure() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "invalid api key"}
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(LlmSettings {
            api_key: "bad".to_string(),
            provider: LlmProvider::OpenAi {
                base_url: server.uri(),
                model: "gpt-4".to_string(),
            },
        })
        .unwrap();
        let err = client.test_connection().await.unwrap_err();
        assert_eq!(err.to_string(), "LLM error: HTTP 401: invalid api key");
    }
}
