//! Text-generation oracle capability.
//!
//! The scheduler only needs one operation: prompt in, free text out.
//! Concrete clients live in `engram-llm`; tests use in-crate mocks.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}
