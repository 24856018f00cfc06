//! Text-generation clients backing the maintenance oracle.
//!
//! Two providers: a local Ollama server and the OpenRouter hosted API.
//! Unlike an interactive chat surface, the maintenance pipeline needs hard
//! failures: a transport error or a missing key is returned as an error so
//! the scheduler can leave the day unprocessed for retry.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use engram_memory::TextOracle;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextOracle for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false
        });

        debug!(model = %self.model, "sending analysis prompt to ollama");
        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("ollama error ({status}): {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(content.to_string()),
            None => bail!("ollama response missing text: {body}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    model: String,
}

impl OpenRouterClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextOracle for OpenRouterClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let api_key = match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENROUTER_API_KEY is not set"),
        };

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        debug!(model = %self.model, "sending analysis prompt to openrouter");
        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("HTTP-Referer", "https://engram.local")
            .header("X-Title", "Engram")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("openrouter error ({status}): {body}");
        }

        match body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
        {
            Some(content) => Ok(content.to_string()),
            None => bail!("openrouter response missing content: {body}"),
        }
    }
}
