//! Text embedding provider
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::EngineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// External text-embedding model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Length of every vector returned by `embed_text`.
    fn dimension(&self) -> usize;

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Gemini `embedContent` client (connection-pooled)
pub struct GeminiEmbeddingProvider {
    client: Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: String, model: String, dimension: usize) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dimension,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if self.api_key.is_empty() {
            return Err(EngineError::InvalidInput(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/{}:embedContent?key={}", self.base_url, self.model, self.api_key);
        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: Content {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
            output_dimensionality: self.dimension,
        };

        debug!(model = %self.model, chars = text.len(), "Calling embedding provider");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Embedding request failed: {}", e);
                EngineError::EmbeddingProvider(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Embedding provider error response: {}", body);
            return Err(status_error(status, body));
        }

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            EngineError::EmbeddingProvider(format!("unparseable embedding response: {}", e))
        })?;

        let values = parsed.embedding.values;
        if values.len() != self.dimension {
            return Err(EngineError::EmbeddingProvider(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                values.len()
            )));
        }

        Ok(values)
    }
}

/// Timeouts and rate limits are worth retrying; other client errors are not.
fn status_error(status: StatusCode, body: String) -> EngineError {
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        EngineError::EmbeddingProvider(format!("{}: {}", status, body))
    } else {
        EngineError::EmbeddingRejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest {
    model: String,
    content: Content,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}
