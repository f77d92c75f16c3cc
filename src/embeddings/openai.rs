// src/embeddings/openai.rs
// OpenAI-compatible embeddings API client

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

/// Max characters to embed (truncate longer text)
const MAX_TEXT_CHARS: usize = 8000;

/// Max batch size for batch embedding
const MAX_BATCH_SIZE: usize = 100;

/// Retry attempts after the first try
const RETRY_ATTEMPTS: usize = 1;

/// Default API endpoint
const DEFAULT_API_URL: &str = "https://api.openai.com/v1/embeddings";

/// OpenAI-compatible embeddings client. Any endpoint that speaks the
/// `/v1/embeddings` wire shape works (OpenAI, vLLM, LM Studio).
pub struct OpenAiEmbeddings {
    api_key: String,
    api_url: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            api_key,
            api_url: DEFAULT_API_URL.to_string(),
            model,
            dimensions,
            http_client,
        }
    }

    /// Point at a non-default OpenAI-compatible endpoint.
    pub fn with_api_url(mut self, url: String) -> Self {
        self.api_url = url;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_chars(text, MAX_TEXT_CHARS);

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            match self
                .http_client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(response) => {
                    if response.status().is_success() {
                        let json: serde_json::Value = response.json().await?;
                        if let Some(values) = json["data"]
                            .as_array()
                            .and_then(|d| d.first())
                            .and_then(|f| f["embedding"].as_array())
                        {
                            let embedding: Vec<f32> = values
                                .iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect();
                            if embedding.len() == self.dimensions {
                                return Ok(embedding);
                            }
                        }
                        anyhow::bail!("Invalid embedding response");
                    } else {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        last_error = Some(anyhow::anyhow!("API error {}: {}", status, text));
                    }
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }

    /// Embed multiple texts, chunked into API-sized batches processed in
    /// parallel
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<&[String]> = texts.chunks(MAX_BATCH_SIZE).collect();
        if chunks.len() == 1 {
            return self.embed_batch_inner(chunks[0]).await;
        }

        debug!("Embedding {} texts in {} parallel batches", texts.len(), chunks.len());
        let futures: Vec<_> = chunks
            .iter()
            .map(|chunk| self.embed_batch_inner(chunk))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut all_results = Vec::with_capacity(texts.len());
        for result in results {
            all_results.extend(result?);
        }
        Ok(all_results)
    }

    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts
            .iter()
            .map(|text| truncate_chars(text, MAX_TEXT_CHARS))
            .collect();

        debug!("Embedding batch of {} texts", inputs.len());

        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
            "dimensions": self.dimensions,
        });

        let response = self
            .http_client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("Batch embed request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Batch API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid batch response"))?;

        // Results carry an index field; sort by it to preserve input order.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            if let Some(values) = item["embedding"].as_array() {
                let vec: Vec<f32> = values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();
                indexed.push((index, vec));
            }
        }
        indexed.sort_by_key(|(i, _)| *i);

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

/// Truncate on a char boundary at or below `max` bytes.
fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation() {
        let long_text = "a".repeat(10000);
        assert_eq!(truncate_chars(&long_text, MAX_TEXT_CHARS).len(), MAX_TEXT_CHARS);
        assert_eq!(truncate_chars("short", MAX_TEXT_CHARS), "short");
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let text = format!("{}é", "a".repeat(7999));
        let truncated = truncate_chars(&text, 8000);
        assert!(truncated.len() <= 8000);
        assert!(text.starts_with(truncated));
    }
}
