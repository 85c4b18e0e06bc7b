//! OpenAI-compatible chat completion backend over HTTP.
//!
//! Endpoint: POST <endpoint> (e.g. https://api.openai.com/v1/chat/completions)
//! Auth: Bearer token (optional, for local servers)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::completion::CompletionBackend;
use super::{AdapterOutput, OperationError};

/// Chat completion client
pub struct HttpBackend {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    /// USD per 1000 tokens, used to report cost
    price_per_1k_tokens: f64,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            price_per_1k_tokens: 0.0,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_price(mut self, price_per_1k_tokens: f64) -> Self {
        self.price_per_1k_tokens = price_per_1k_tokens;
        self
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.endpoint.trim_end_matches("/chat/completions"))
    }

    fn parse_output(&self, response: ChatResponse) -> Result<AdapterOutput, OperationError> {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OperationError::Failed("Completion response has no content".to_string()))?;

        let tokens = response.usage.map(|u| u.total_tokens);
        Ok(AdapterOutput {
            content,
            tokens_used: tokens,
            cost_usd: tokens.map(|t| t as f64 / 1000.0 * self.price_per_1k_tokens),
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<AdapterOutput, OperationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut builder = self.client.post(&self.endpoint).timeout(timeout).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OperationError::Timeout {
                    operation: format!("completion from {}", self.endpoint),
                    after: timeout,
                }
            } else {
                OperationError::Failed(format!("Failed to reach {}: {}", self.endpoint, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OperationError::Failed(format!("Completion error ({}): {}", status, text)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| OperationError::Failed(format!("Failed to parse completion response: {}", e)))?;

        let output = self.parse_output(body)?;
        debug!(model = %self.model, tokens = ?output.tokens_used, "Completion received");
        Ok(output)
    }

    async fn health_check(&self) -> Result<()> {
        let mut builder = self.client.get(self.models_url());
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.context("Failed to reach completion endpoint")?;
        if !response.status().is_success() {
            anyhow::bail!("Completion endpoint health check failed: {}", response.status());
        }
        Ok(())
    }
}
