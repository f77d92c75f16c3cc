// src/llm.rs
// AI completion client used by the distiller and troubleshoot components

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ContextdError, Result};
use crate::http::DEFAULT_TIMEOUT;

/// Default API endpoint
const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Text-generation client contract. One prompt in, one completion out;
/// implementations are safe for concurrent use.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiChatClient {
    api_key: String,
    api_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(api_key: String, model: String, http_client: reqwest::Client) -> Self {
        Self {
            api_key,
            api_url: DEFAULT_API_URL.to_string(),
            model,
            http_client,
        }
    }

    /// Build from environment, if a key is configured.
    pub fn from_env(http_client: reqwest::Client) -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let model =
            std::env::var("CONTEXTD_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let mut client = Self::new(api_key, model, http_client);
        if let Ok(url) = std::env::var("CONTEXTD_AI_URL") {
            client.api_url = url;
        }
        Some(client)
    }
}

#[async_trait]
impl AiClient for OpenAiChatClient {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        debug!(model = %self.model, "AI completion request ({} chars)", prompt.len());

        let request = self
            .http_client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ContextdError::Cancelled),
            result = tokio::time::timeout(DEFAULT_TIMEOUT, request) => result
                .map_err(|_| ContextdError::timeout("ai_complete"))?
                .map_err(|e| ContextdError::ExternalUnavailable(format!("ai_complete: {e}")))?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ContextdError::ExternalUnavailable(format!(
                "ai_complete: API error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ContextdError::ExternalUnavailable(format!("ai_complete: {e}")))?;
        json["choices"]
            .as_array()
            .and_then(|c| c.first())
            .and_then(|c| c["message"]["content"].as_str())
            .map(String::from)
            .ok_or_else(|| {
                ContextdError::ExternalUnavailable("ai_complete: malformed response".into())
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Strip a markdown code fence from an AI response, if present. Models
/// routinely wrap JSON answers in ```json blocks despite instructions.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Test doubles. Kept out of the default surface but compiled always so
/// integration tests can drive AI-dependent components offline.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Canned-response client for tests.
    pub struct StaticAiClient {
        responses: Mutex<Vec<String>>,
    }

    impl StaticAiClient {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl AiClient for StaticAiClient {
        async fn complete(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<String> {
            let mut responses = self
                .responses
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if responses.is_empty() {
                return Err(ContextdError::ExternalUnavailable("no canned response".into()));
            }
            Ok(responses.remove(0))
        }

        fn model_name(&self) -> &str {
            "static-test"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_static_client_drains_responses() {
        use testing::StaticAiClient;
        let client = StaticAiClient::new(vec!["one".into()]);
        let cancel = CancellationToken::new();
        assert_eq!(client.complete("p", &cancel).await.unwrap(), "one");
        assert!(client.complete("p", &cancel).await.is_err());
    }
}
