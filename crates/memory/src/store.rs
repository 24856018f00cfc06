//! The long-term memory store capability.
//!
//! The store itself is an external service; this module defines the five
//! operations the core is allowed to use, plus the two HTTP backends that
//! provide them.  Backend response conventions differ (the hosted platform
//! wraps arrays in `{"results": [...]}` and speaks camelCase; the self-hosted
//! server returns flat arrays in snake_case), so both funnel through the
//! [`normalize`] boundary and the rest of the core only ever sees the
//! canonical [`MemoryItem`] / [`AddResult`] shapes.

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};

use crate::schema::{AddResult, MemoryItem};

#[derive(Debug, Clone, Serialize)]
pub struct StoreMessage {
    pub role: String,
    pub content: String,
}

impl StoreMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub user_id: Option<String>,
    /// Let the store run its own fact extraction over the messages instead of
    /// storing them verbatim.
    pub infer: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

/// The five operations the core may perform against long-term memory.
/// Promotion during maintenance is `add`; everything else serves retrieval
/// and reporting.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(
        &self,
        messages: &[StoreMessage],
        options: &AddOptions,
    ) -> Result<Vec<AddResult>>;
    async fn search(&self, query: &str, options: &QueryOptions) -> Result<Vec<MemoryItem>>;
    async fn get(&self, id: &str) -> Result<Option<MemoryItem>>;
    async fn get_all(&self, options: &QueryOptions) -> Result<Vec<MemoryItem>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ── Response normalization ────────────────────────────────────────────────────

/// Both backends' responses collapse here into canonical shapes; nothing
/// convention-specific escapes this module.
pub mod normalize {
    use serde_json::{Map, Value};

    use crate::schema::{AddResult, MemoryEvent, MemoryItem};

    fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(String::from)
    }

    fn unwrap_results(value: &Value) -> Option<&Vec<Value>> {
        value
            .as_array()
            .or_else(|| value.get("results").and_then(Value::as_array))
    }

    pub fn memory_item(value: &Value) -> Option<MemoryItem> {
        let obj = value.as_object()?;
        let id = first_str(obj, &["id", "memory_id", "memoryId"])?;
        let memory = first_str(obj, &["memory", "text", "content"]).unwrap_or_default();
        Some(MemoryItem {
            id,
            memory,
            score: obj.get("score").and_then(Value::as_f64),
            created_at: first_str(obj, &["created_at", "createdAt"]),
        })
    }

    pub fn memory_items(value: &Value) -> Vec<MemoryItem> {
        unwrap_results(value)
            .map(|arr| arr.iter().filter_map(memory_item).collect())
            .unwrap_or_default()
    }

    pub fn add_results(value: &Value) -> Vec<AddResult> {
        unwrap_results(value)
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let obj = item.as_object()?;
                        Some(AddResult {
                            id: first_str(obj, &["id", "memory_id", "memoryId"])
                                .unwrap_or_default(),
                            memory: first_str(obj, &["memory", "text", "content"])
                                .unwrap_or_default(),
                            event: first_str(obj, &["event"])
                                .map(|e| MemoryEvent::from_label(&e))
                                .unwrap_or(MemoryEvent::Noop),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── HTTP backends ─────────────────────────────────────────────────────────────

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        bail!("memory store error ({status}): {body}");
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

/// Self-hosted memory server: snake_case fields, flat array responses.
#[derive(Debug, Clone)]
pub struct LocalStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LocalStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl MemoryStore for LocalStore {
    async fn add(
        &self,
        messages: &[StoreMessage],
        options: &AddOptions,
    ) -> Result<Vec<AddResult>> {
        let payload = json!({
            "messages": messages,
            "user_id": options.user_id,
            "infer": options.infer,
        });
        let response = self
            .authed(self.client.post(self.endpoint("/memories")))
            .json(&payload)
            .send()
            .await?;
        Ok(normalize::add_results(&read_json(response).await?))
    }

    async fn search(&self, query: &str, options: &QueryOptions) -> Result<Vec<MemoryItem>> {
        let payload = json!({
            "query": query,
            "user_id": options.user_id,
            "limit": options.limit,
        });
        let response = self
            .authed(self.client.post(self.endpoint("/memories/search")))
            .json(&payload)
            .send()
            .await?;
        Ok(normalize::memory_items(&read_json(response).await?))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let response = self
            .authed(self.client.get(self.endpoint(&format!("/memories/{id}"))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(normalize::memory_item(&read_json(response).await?))
    }

    async fn get_all(&self, options: &QueryOptions) -> Result<Vec<MemoryItem>> {
        let mut req = self.authed(self.client.get(self.endpoint("/memories")));
        if let Some(user_id) = &options.user_id {
            req = req.query(&[("user_id", user_id.as_str())]);
        }
        if let Some(limit) = options.limit {
            req = req.query(&[("limit", limit)]);
        }
        Ok(normalize::memory_items(&read_json(req.send().await?).await?))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .authed(self.client.delete(self.endpoint(&format!("/memories/{id}"))))
            .send()
            .await?;
        read_json(response).await?;
        Ok(())
    }
}

/// Hosted platform API: camelCase fields, `{"results": [...]}` wrapping.
#[derive(Debug, Clone)]
pub struct PlatformStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PlatformStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl MemoryStore for PlatformStore {
    async fn add(
        &self,
        messages: &[StoreMessage],
        options: &AddOptions,
    ) -> Result<Vec<AddResult>> {
        let payload = json!({
            "messages": messages,
            "userId": options.user_id,
            "infer": options.infer,
        });
        let response = self
            .client
            .post(self.endpoint("/memories"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        Ok(normalize::add_results(&read_json(response).await?))
    }

    async fn search(&self, query: &str, options: &QueryOptions) -> Result<Vec<MemoryItem>> {
        let payload = json!({
            "query": query,
            "userId": options.user_id,
            "limit": options.limit,
        });
        let response = self
            .client
            .post(self.endpoint("/memories/search"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        Ok(normalize::memory_items(&read_json(response).await?))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let response = self
            .client
            .get(self.endpoint(&format!("/memories/{id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(normalize::memory_item(&read_json(response).await?))
    }

    async fn get_all(&self, options: &QueryOptions) -> Result<Vec<MemoryItem>> {
        let mut req = self
            .client
            .get(self.endpoint("/memories"))
            .bearer_auth(&self.api_key);
        if let Some(user_id) = &options.user_id {
            req = req.query(&[("userId", user_id.as_str())]);
        }
        if let Some(limit) = options.limit {
            req = req.query(&[("limit", limit)]);
        }
        Ok(normalize::memory_items(&read_json(req.send().await?).await?))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&format!("/memories/{id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        read_json(response).await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
